mod completion;
mod locks;
mod tickets;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use clap::ArgMatches;
use remedy_core::{Priority, RemedyConfig, TicketId, TicketService};

/// Load config, open the store, run the subcommand and print its envelope.
pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let service = TicketService::open(&config)
        .await
        .context("Failed to open ticket store")?;

    let result = execute(&service, matches).await;
    service.close().await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Run the selected subcommand against `service` and return its envelope.
pub async fn execute(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    match matches.subcommand() {
        Some(("create", sub_m)) => tickets::handle_create(service, sub_m).await,
        Some(("get", sub_m)) => tickets::handle_get(service, sub_m).await,
        Some(("list", sub_m)) => tickets::handle_list(service, sub_m).await,
        Some(("stats", _)) => tickets::handle_stats(service).await,
        Some(("delete", sub_m)) => tickets::handle_delete(service, sub_m).await,
        Some(("next", sub_m)) => locks::handle_next(service, sub_m).await,
        Some(("acquire", sub_m)) => locks::handle_acquire(service, sub_m).await,
        Some(("renew", sub_m)) => locks::handle_renew(service, sub_m).await,
        Some(("release", sub_m)) => locks::handle_release(service, sub_m).await,
        Some(("lock-state", sub_m)) => locks::handle_lock_state(service, sub_m).await,
        Some(("cleanup", _)) => locks::handle_cleanup(service).await,
        Some(("complete", sub_m)) => completion::handle_complete(service, sub_m).await,
        _ => anyhow::bail!("Unknown command. Run 'remedy --help' for usage."),
    }
}

fn load_config(matches: &ArgMatches) -> Result<RemedyConfig> {
    let explicit = matches.get_one::<String>("config").map(Path::new);
    let mut config = RemedyConfig::load(explicit)?;
    if let Some(db) = matches.get_one::<String>("db") {
        config.store.path = Some(PathBuf::from(db));
    }
    Ok(config)
}

fn ticket_id(matches: &ArgMatches) -> Result<TicketId> {
    matches
        .get_one::<TicketId>("id")
        .copied()
        .context("Missing ticket id")
}

fn required_str<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("Missing --{name}"))
}

fn optional_string(matches: &ArgMatches, name: &str) -> Option<String> {
    matches.get_one::<String>(name).cloned()
}

fn lease(matches: &ArgMatches) -> Option<Duration> {
    matches
        .get_one::<i64>("lease-secs")
        .map(|secs| Duration::seconds(*secs))
}

fn priorities(matches: &ArgMatches) -> Vec<Priority> {
    matches
        .get_many::<Priority>("priority")
        .map(|values| values.copied().collect())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use remedy_core::{ManualClock, RemedyConfig, Store, TicketService};

    use super::*;
    use crate::cli::build_cli;

    pub async fn service() -> Result<(TicketService, ManualClock)> {
        let clock = ManualClock::starting_now();
        let store = Store::open_in_memory().await?;
        let service = TicketService::new(store, &RemedyConfig::default(), Arc::new(clock.clone()));
        Ok((service, clock))
    }

    pub async fn run(service: &TicketService, args: &[&str]) -> Result<serde_json::Value> {
        let argv = std::iter::once("remedy").chain(args.iter().copied());
        let matches = build_cli().try_get_matches_from(argv)?;
        execute(service, &matches).await
    }
}
