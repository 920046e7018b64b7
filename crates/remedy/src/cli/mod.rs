pub mod handlers;

use clap::{Arg, ArgAction, Command};
use remedy_core::{Priority, TicketId, TicketStatus};

pub fn build_cli() -> Command {
    Command::new("remedy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Lease-locked remediation tickets for concurrent workers")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_name("PATH")
                .help("Config file (default: <config dir>/remedy/config.toml)"),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .global(true)
                .value_name("PATH")
                .help("Ticket database, overriding config and REMEDY_DB_PATH"),
        )
        .subcommand(cmd_create())
        .subcommand(cmd_get())
        .subcommand(cmd_list())
        .subcommand(cmd_stats())
        .subcommand(cmd_delete())
        .subcommand(cmd_next())
        .subcommand(cmd_acquire())
        .subcommand(cmd_renew())
        .subcommand(cmd_release())
        .subcommand(cmd_lock_state())
        .subcommand(cmd_complete())
        .subcommand(cmd_cleanup())
}

fn parse_ticket_id(value: &str) -> Result<TicketId, String> {
    value.parse::<TicketId>().map_err(|e| e.to_string())
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    value
        .parse::<Priority>()
        .map_err(|_| format!("invalid priority '{value}' (expected P0-P4)"))
}

fn parse_status(value: &str) -> Result<TicketStatus, String> {
    value
        .parse::<TicketStatus>()
        .map_err(|_| format!("invalid status '{value}' (expected open or completed)"))
}

fn parse_context_entry(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, val)| (key.trim().to_string(), val.to_string()))
        .ok_or_else(|| format!("invalid context entry '{value}' (expected KEY=VALUE)"))
}

fn arg_id() -> Arg {
    Arg::new("id")
        .required(true)
        .value_name("ID")
        .value_parser(parse_ticket_id)
        .help("Ticket id (a leading '#' is accepted)")
}

fn arg_actor() -> Arg {
    Arg::new("actor")
        .long("actor")
        .required(true)
        .value_name("ACTOR")
        .help("Worker identity holding the lease")
}

fn arg_lease() -> Arg {
    Arg::new("lease-secs")
        .long("lease-secs")
        .value_name("SECONDS")
        .value_parser(clap::value_parser!(i64).range(1..=86_400))
        .help("Lease length (default: lease.default_secs)")
}

fn arg_priorities() -> Arg {
    Arg::new("priority")
        .long("priority")
        .value_name("P0-P4")
        .action(ArgAction::Append)
        .value_parser(parse_priority)
        .help("Restrict to this priority band (repeatable)")
}

fn cmd_create() -> Command {
    Command::new("create")
        .about("Create an open, unlocked ticket")
        .arg(
            Arg::new("priority")
                .long("priority")
                .required(true)
                .value_name("P0-P4")
                .value_parser(parse_priority),
        )
        .arg(Arg::new("error-type").long("error-type").required(true))
        .arg(Arg::new("message").long("message").required(true))
        .arg(Arg::new("source").long("source").required(true))
        .arg(Arg::new("stack-trace").long("stack-trace"))
        .arg(
            Arg::new("context")
                .long("context")
                .value_name("KEY=VALUE")
                .action(ArgAction::Append)
                .value_parser(parse_context_entry)
                .help("File context entry (repeatable)"),
        )
}

fn cmd_get() -> Command {
    Command::new("get").about("Show one ticket").arg(arg_id())
}

fn cmd_list() -> Command {
    Command::new("list")
        .about("List tickets by priority, oldest first")
        .arg(
            Arg::new("status")
                .long("status")
                .value_parser(parse_status),
        )
        .arg(arg_priorities())
        .arg(
            Arg::new("locked")
                .long("locked")
                .value_parser(clap::value_parser!(bool))
                .help("Only tickets with (true) or without (false) lock fields"),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .value_parser(clap::value_parser!(u32)),
        )
}

fn cmd_stats() -> Command {
    Command::new("stats").about("Counts by status and priority")
}

fn cmd_delete() -> Command {
    Command::new("delete")
        .about("Soft-delete a ticket and free its lease")
        .arg(arg_id())
}

fn cmd_next() -> Command {
    Command::new("next")
        .about("Lock and return the most urgent eligible ticket")
        .arg(arg_actor())
        .arg(arg_lease())
        .arg(arg_priorities())
}

fn cmd_acquire() -> Command {
    Command::new("acquire")
        .about("Lock a specific ticket")
        .arg(arg_id())
        .arg(arg_actor())
        .arg(arg_lease())
}

fn cmd_renew() -> Command {
    Command::new("renew")
        .about("Extend a lease you hold")
        .arg(arg_id())
        .arg(arg_actor())
        .arg(arg_lease())
}

fn cmd_release() -> Command {
    Command::new("release")
        .about("Give up a lease you hold")
        .arg(arg_id())
        .arg(arg_actor())
}

fn cmd_lock_state() -> Command {
    Command::new("lock-state")
        .about("Show a ticket's lease")
        .arg(arg_id())
}

fn cmd_complete() -> Command {
    Command::new("complete")
        .about("Close a ticket with completion evidence")
        .arg(arg_id())
        .arg(Arg::new("notes").long("notes").required(true))
        .arg(Arg::new("steps").long("steps").required(true))
        .arg(Arg::new("results").long("results").required(true))
        .arg(Arg::new("completed-by").long("completed-by"))
        .arg(Arg::new("commit-ref").long("commit-ref"))
        .arg(
            Arg::new("file")
                .long("file")
                .action(ArgAction::Append)
                .help("File changed by the fix (repeatable)"),
        )
}

fn cmd_cleanup() -> Command {
    Command::new("cleanup").about("Clear every lapsed lease")
}
