use anyhow::Result;
use clap::ArgMatches;
use remedy_core::{FileContext, NewTicket, Priority, TicketFilter, TicketService, TicketStatus};
use serde_json::json;

use super::{optional_string, priorities, required_str, ticket_id};
use crate::output::Envelope;

pub async fn handle_create(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let priority = matches
        .get_one::<Priority>("priority")
        .copied()
        .ok_or_else(|| anyhow::anyhow!("Missing --priority"))?;

    let mut ticket = NewTicket::new(
        priority,
        required_str(matches, "error-type")?,
        required_str(matches, "message")?,
        required_str(matches, "source")?,
    );
    if let Some(stack_trace) = optional_string(matches, "stack-trace") {
        ticket = ticket.with_stack_trace(stack_trace);
    }
    if let Some(entries) = matches.get_many::<(String, String)>("context") {
        let context = entries.fold(FileContext::new(), |ctx, (key, value)| ctx.with(key, value));
        ticket = ticket.with_file_context(context);
    }

    let created = service.create_ticket(&ticket).await?;
    Ok(Envelope::single("ticket-response", created).into_value()?)
}

pub async fn handle_get(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let ticket = service.get_ticket(ticket_id(matches)?).await?;
    Ok(Envelope::single("ticket-response", ticket).into_value()?)
}

pub async fn handle_list(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let filter = TicketFilter {
        status: matches.get_one::<TicketStatus>("status").copied(),
        priorities: priorities(matches),
        locked: matches.get_one::<bool>("locked").copied(),
        limit: matches.get_one::<u32>("limit").copied(),
    };
    let tickets = service.list_tickets(&filter).await?;
    Ok(Envelope::array("ticket-list-response", tickets).into_value()?)
}

pub async fn handle_stats(service: &TicketService) -> Result<serde_json::Value> {
    let stats = service.get_stats().await?;
    Ok(Envelope::single("stats-response", stats).into_value()?)
}

pub async fn handle_delete(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let id = ticket_id(matches)?;
    let deleted = service.delete_ticket(id).await?;
    Ok(Envelope::single("delete-response", json!({ "ticket_id": id, "deleted": deleted })).into_value()?)
}
