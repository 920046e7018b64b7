use anyhow::Result;
use clap::ArgMatches;
use remedy_core::{CompletionEvidence, CompletionMetadata, TicketService};
use serde_json::json;

use super::{optional_string, required_str, ticket_id};
use crate::output::Envelope;

pub async fn handle_complete(service: &TicketService, matches: &ArgMatches) -> Result<serde_json::Value> {
    let id = ticket_id(matches)?;
    let evidence = CompletionEvidence::new(
        required_str(matches, "notes")?,
        required_str(matches, "steps")?,
        required_str(matches, "results")?,
    )
    .with_metadata(CompletionMetadata {
        completed_by: optional_string(matches, "completed-by"),
        commit_ref: optional_string(matches, "commit-ref"),
        files_changed: matches
            .get_many::<String>("file")
            .map(|files| files.cloned().collect())
            .unwrap_or_default(),
    });

    let completed = service.mark_complete(id, &evidence).await?;
    Ok(Envelope::single(
        "complete-response",
        json!({ "ticket_id": id, "completed": completed }),
    )
    .into_value()?)
}
