use anyhow::Result;
use clap::ArgMatches;
use remedy_core::TicketService;
use serde_json::json;

use super::{lease, priorities, required_str, ticket_id};
use crate::output::Envelope;

pub async fn handle_next(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let actor = required_str(matches, "actor")?;
    let filter = priorities(matches);
    let filter = (!filter.is_empty()).then_some(filter.as_slice());

    let ticket = service
        .get_and_lock_next_ticket(actor, lease(matches), filter)
        .await?;
    Ok(Envelope::single("next-response", json!({ "ticket": ticket })).into_value()?)
}

pub async fn handle_acquire(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let outcome = service
        .acquire_lock(ticket_id(matches)?, required_str(matches, "actor")?, lease(matches))
        .await?;
    Ok(Envelope::single("acquire-response", outcome).into_value()?)
}

pub async fn handle_renew(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let outcome = service
        .renew_lock(ticket_id(matches)?, required_str(matches, "actor")?, lease(matches))
        .await?;
    Ok(Envelope::single("renew-response", outcome).into_value()?)
}

pub async fn handle_release(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let id = ticket_id(matches)?;
    let released = service
        .release_lock(id, required_str(matches, "actor")?)
        .await?;
    Ok(Envelope::single("release-response", json!({ "ticket_id": id, "released": released }))
        .into_value()?)
}

pub async fn handle_lock_state(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let state = service.lock_state(ticket_id(matches)?).await?;
    Ok(Envelope::single("lock-state-response", state).into_value()?)
}

pub async fn handle_cleanup(service: &TicketService) -> Result<serde_json::Value> {
    let cleared = service.cleanup_expired_locks().await?;
    Ok(Envelope::single("cleanup-response", json!({ "cleared": cleared })).into_value()?)
}
