//! Lifecycle events for observability collaborators.
//!
//! Every transition is logged through `tracing` and fanned out on a
//! broadcast channel. Events are published only after the owning
//! transaction has committed or rolled back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ticket::TicketId;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Event types in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Ticket accepted from the creation collaborator
    TicketCreated,
    /// Lease granted (direct acquire or dispatch)
    LockAcquired,
    /// Lease extended by its holder
    LockRenewed,
    /// Lease given up by its holder
    LockReleased,
    /// Lapsed lease cleared so the ticket can be dispatched again
    LockExpiredReclaimed,
    /// Ticket passed the completion gate
    TicketCompleted,
    /// Completion evidence rejected
    CompletionValidationFailed,
    /// Creation refused by the active-ticket cap
    CapacityExceeded,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TicketCreated => "TICKET_CREATED",
            Self::LockAcquired => "LOCK_ACQUIRED",
            Self::LockRenewed => "LOCK_RENEWED",
            Self::LockReleased => "LOCK_RELEASED",
            Self::LockExpiredReclaimed => "LOCK_EXPIRED_RECLAIMED",
            Self::TicketCompleted => "TICKET_COMPLETED",
            Self::CompletionValidationFailed => "COMPLETION_VALIDATION_FAILED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }

    const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::CompletionValidationFailed | Self::CapacityExceeded
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Absent only for refused creations
    pub ticket_id: Option<TicketId>,
    pub actor: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl TicketEvent {
    #[must_use]
    pub const fn new(event_type: EventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            timestamp,
            ticket_id: None,
            actor: None,
            data: None,
        }
    }

    #[must_use]
    pub const fn with_ticket(mut self, id: TicketId) -> Self {
        self.ticket_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Publishes events to the log and to any subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TicketEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: TicketEvent) {
        let ticket_id = event.ticket_id.map(TicketId::get);
        let actor = event.actor.as_deref().unwrap_or("-");
        if event.event_type.is_failure() {
            tracing::warn!(
                event = event.event_type.as_str(),
                ticket_id,
                actor,
                data = ?event.data,
                "ticket event"
            );
        } else {
            tracing::info!(
                event = event.event_type.as_str(),
                ticket_id,
                actor,
                "ticket event"
            );
        }
        // No subscribers is fine; the log line above is the durable record.
        let _ = self.sender.send(event);
    }
}
