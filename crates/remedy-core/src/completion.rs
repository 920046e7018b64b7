//! Completion gate: the only path from `Open` to `Completed`.
//!
//! The gate is the single owner of the evidence thresholds. Callers above it
//! may pre-check idempotency for nicer diagnostics but never re-validate
//! evidence lengths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::{
    clock::SharedClock,
    config::FieldLimits,
    events::{EventBus, EventType, TicketEvent},
    repository::fetch_ticket,
    store::{to_millis, Store, TxMode},
    ticket::{CompletionMetadata, TicketId},
    Error, Result,
};

/// Minimum trimmed length of `completion_notes`.
pub const MIN_COMPLETION_NOTES: usize = 20;
/// Minimum trimmed length of `test_steps`.
pub const MIN_TEST_STEPS: usize = 10;
/// Minimum trimmed length of `test_results`.
pub const MIN_TEST_RESULTS: usize = 10;

/// What a worker submits to close a ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvidence {
    /// What was wrong and how it was fixed
    pub completion_notes: String,
    /// How the fix was verified
    pub test_steps: String,
    /// What the verification showed
    pub test_results: String,
    #[serde(default)]
    pub metadata: CompletionMetadata,
}

impl CompletionEvidence {
    #[must_use]
    pub fn new(
        completion_notes: impl Into<String>,
        test_steps: impl Into<String>,
        test_results: impl Into<String>,
    ) -> Self {
        Self {
            completion_notes: completion_notes.into(),
            test_steps: test_steps.into(),
            test_results: test_results.into(),
            metadata: CompletionMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: CompletionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Trim every field and check it against the minimums and `limits`.
    fn validated(&self, limits: &FieldLimits) -> Result<TrimmedEvidence<'_>> {
        let fields = [
            (
                "completion_notes",
                self.completion_notes.trim(),
                MIN_COMPLETION_NOTES,
                limits.completion_notes,
            ),
            (
                "test_steps",
                self.test_steps.trim(),
                MIN_TEST_STEPS,
                limits.test_steps,
            ),
            (
                "test_results",
                self.test_results.trim(),
                MIN_TEST_RESULTS,
                limits.test_results,
            ),
        ];
        for (field, value, required_min, limit) in fields {
            let actual = value.chars().count();
            if actual < required_min {
                return Err(Error::ValidationFailed {
                    field,
                    required_min,
                    actual,
                });
            }
            FieldLimits::check(field, value, limit)?;
        }

        Ok(TrimmedEvidence {
            completion_notes: self.completion_notes.trim(),
            test_steps: self.test_steps.trim(),
            test_results: self.test_results.trim(),
        })
    }
}

struct TrimmedEvidence<'a> {
    completion_notes: &'a str,
    test_steps: &'a str,
    test_results: &'a str,
}

#[derive(Debug)]
enum GateDecision {
    /// Absent, deleted or already completed
    Skipped,
    Completed { previous_holder: Option<String> },
}

#[derive(Debug, Clone)]
pub struct CompletionGate {
    store: Store,
    clock: SharedClock,
    events: EventBus,
    limits: FieldLimits,
}

impl CompletionGate {
    #[must_use]
    pub const fn new(store: Store, clock: SharedClock, events: EventBus, limits: FieldLimits) -> Self {
        Self {
            store,
            clock,
            events,
            limits,
        }
    }

    /// Mark a ticket completed with the given evidence.
    ///
    /// Returns `Ok(false)` without touching anything if the ticket does not
    /// exist or is already completed. Evidence below the minimums fails with
    /// [`Error::ValidationFailed`], also without mutation. On success the
    /// lock is cleared and the evidence stored in the same transaction.
    pub async fn mark_complete(&self, id: TicketId, evidence: &CompletionEvidence) -> Result<bool> {
        let now = self.clock.now();

        let mut tx = self.store.begin(TxMode::Reserving).await?;
        let result = match tx.conn() {
            Ok(conn) => self.complete_in(conn, id, evidence, now).await,
            Err(e) => Err(e),
        };
        let outcome = tx.finish(result).await;

        let actor = evidence.metadata.completed_by.as_deref();
        match outcome {
            Ok(GateDecision::Completed { previous_holder }) => {
                let mut event = TicketEvent::new(EventType::TicketCompleted, now)
                    .with_ticket(id)
                    .with_data(serde_json::json!({
                        "commit_ref": evidence.metadata.commit_ref,
                        "files_changed": evidence.metadata.files_changed.len(),
                    }));
                if let Some(actor) = actor.or(previous_holder.as_deref()) {
                    event = event.with_actor(actor);
                }
                self.events.emit(event);
                Ok(true)
            }
            Ok(GateDecision::Skipped) => {
                tracing::info!(ticket_id = id.get(), "completion skipped: missing or already completed");
                Ok(false)
            }
            Err(Error::ValidationFailed {
                field,
                required_min,
                actual,
            }) => {
                let mut event = TicketEvent::new(EventType::CompletionValidationFailed, now)
                    .with_ticket(id)
                    .with_data(serde_json::json!({
                        "field": field,
                        "required_min": required_min,
                        "actual": actual,
                    }));
                if let Some(actor) = actor {
                    event = event.with_actor(actor);
                }
                self.events.emit(event);
                Err(Error::ValidationFailed {
                    field,
                    required_min,
                    actual,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn complete_in(
        &self,
        conn: &mut SqliteConnection,
        id: TicketId,
        evidence: &CompletionEvidence,
        now: DateTime<Utc>,
    ) -> Result<GateDecision> {
        let ticket = match fetch_ticket(conn, id).await? {
            Some(ticket) if !ticket.is_completed() => ticket,
            _ => return Ok(GateDecision::Skipped),
        };

        let trimmed = evidence.validated(&self.limits)?;
        let metadata = serde_json::to_string(&evidence.metadata)?;

        let written = sqlx::query(
            "UPDATE tickets SET status = 'completed', \
             locked_by = NULL, locked_at = NULL, lease_expires = NULL, \
             completion_notes = ?, test_steps = ?, test_results = ?, \
             completion_metadata = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'open' AND deleted = 0",
        )
        .bind(trimmed.completion_notes)
        .bind(trimmed.test_steps)
        .bind(trimmed.test_results)
        .bind(metadata)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(id.get())
        .execute(&mut *conn)
        .await?;

        if written.rows_affected() == 0 {
            return Ok(GateDecision::Skipped);
        }
        Ok(GateDecision::Completed {
            previous_holder: ticket.lock.map(|l| l.locked_by),
        })
    }
}
