//! Ticket domain types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::{Error, Result};

/// Unique ticket identifier, assigned by the store at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(i64);

impl TicketId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TicketId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .trim_start_matches('#')
            .parse::<i64>()
            .map(Self)
            .map_err(|e| Error::Parse(format!("Invalid ticket id '{s}': {e}")))
    }
}

/// Urgency band. `P0` is the most urgent and is dispatched first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    /// Storage rank; lower sorts first.
    #[must_use]
    pub const fn rank(self) -> i64 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P3 => 3,
            Self::P4 => 4,
        }
    }

    pub fn from_rank(rank: i64) -> Result<Self> {
        match rank {
            0 => Ok(Self::P0),
            1 => Ok(Self::P1),
            2 => Ok(Self::P2),
            3 => Ok(Self::P3),
            4 => Ok(Self::P4),
            other => Err(Error::Parse(format!("Invalid priority rank: {other}"))),
        }
    }
}

/// Persisted ticket status. Moves only from `Open` to `Completed`.
///
/// "In progress" is not a status: it is an `Open` ticket holding a live lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Completed,
}

impl TicketStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// String-keyed context captured with the originating error (file paths,
/// surrounding lines, environment hints). Persisted as one JSON blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileContext(BTreeMap<String, String>);

impl FileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize and enforce the total byte cap.
    pub fn to_blob(&self, max_bytes: usize) -> Result<String> {
        let blob = serde_json::to_string(&self.0)?;
        if blob.len() > max_bytes {
            return Err(Error::FileContextTooLarge {
                limit: max_bytes,
                actual: blob.len(),
            });
        }
        Ok(blob)
    }

    pub fn from_blob(blob: &str) -> Result<Self> {
        serde_json::from_str(blob)
            .map(Self)
            .map_err(|e| Error::Parse(format!("Corrupt file context blob: {e}")))
    }
}

/// Lease currently recorded on a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Actor holding the lease
    pub locked_by: String,
    /// When the lease was granted
    pub locked_at: DateTime<Utc>,
    /// When the lease lapses
    pub lease_expires: DateTime<Utc>,
}

impl LockInfo {
    /// A lease is live until the instant it expires; from then on anyone may
    /// take the ticket.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires >= now
    }
}

/// Optional context recorded alongside completion evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    /// Actor that completed the ticket
    pub completed_by: Option<String>,
    /// Commit, change or patch reference carrying the fix
    pub commit_ref: Option<String>,
    /// Files touched by the fix
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// Evidence stored when a ticket passes the completion gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub completion_notes: String,
    pub test_steps: String,
    pub test_results: String,
    pub completed_at: DateTime<Utc>,
    pub metadata: CompletionMetadata,
}

/// A remediation ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Store-assigned identifier
    pub id: TicketId,
    /// Dispatch band; P0 is served first
    pub priority: Priority,
    /// Open or Completed
    pub status: TicketStatus,
    /// Error class reported by the source (e.g. `TypeError`)
    pub error_type: String,
    /// Error message as reported
    pub message: String,
    /// System or service that raised the error
    pub source: String,
    /// Raw stack trace, if the source sent one
    pub stack_trace: Option<String>,
    /// File path to snippet map attached at creation
    pub file_context: Option<FileContext>,
    /// Creation time; breaks ties within a priority band
    pub created_at: DateTime<Utc>,
    /// Time of the last write to any field
    pub updated_at: DateTime<Utc>,
    /// Present iff `locked_by`, `locked_at` and `lease_expires` are all set.
    pub lock: Option<LockInfo>,
    /// Present iff the ticket is `Completed`.
    pub completion: Option<CompletionRecord>,
}

impl Ticket {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Open and holding a live lease.
    #[must_use]
    pub fn is_in_progress_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed() && self.lock.as_ref().is_some_and(|l| l.is_live_at(now))
    }

    #[must_use]
    pub fn locked_by(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.locked_by.as_str())
    }
}

/// Input from the ticket-creation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTicket {
    /// Dispatch band for the new ticket
    pub priority: Priority,
    /// Error class, checked against `limits.error_type`
    pub error_type: String,
    /// Error message, checked against `limits.message`
    pub message: String,
    /// Reporting system, checked against `limits.source`
    pub source: String,
    /// Optional stack trace, checked against `limits.stack_trace`
    pub stack_trace: Option<String>,
    /// Optional snippets; the serialized blob is capped at `limits.file_context_max_bytes`
    pub file_context: Option<FileContext>,
}

impl NewTicket {
    #[must_use]
    pub fn new(
        priority: Priority,
        error_type: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            priority,
            error_type: error_type.into(),
            message: message.into(),
            source: source.into(),
            stack_trace: None,
            file_context: None,
        }
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    #[must_use]
    pub fn with_file_context(mut self, file_context: FileContext) -> Self {
        self.file_context = Some(file_context);
        self
    }
}

/// Partial update of a ticket's descriptive text. Priority, status, lock and
/// evidence fields are owned by other components and cannot be set here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketUpdate {
    pub error_type: Option<String>,
    pub message: Option<String>,
    pub source: Option<String>,
    pub stack_trace: Option<String>,
    pub file_context: Option<FileContext>,
}

impl TicketUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.error_type.is_none()
            && self.message.is_none()
            && self.source.is_none()
            && self.stack_trace.is_none()
            && self.file_context.is_none()
    }
}

/// Selection for `list`. Results are always ordered by priority, then
/// creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    /// Empty means every priority.
    pub priorities: Vec<Priority>,
    /// `Some(true)`: only tickets with lock fields set; `Some(false)`: only unlocked.
    pub locked: Option<bool>,
    pub limit: Option<u32>,
}

impl TicketFilter {
    #[must_use]
    pub fn open() -> Self {
        Self {
            status: Some(TicketStatus::Open),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_priorities(mut self, priorities: impl IntoIterator<Item = Priority>) -> Self {
        self.priorities = priorities.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Counts over non-deleted tickets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketStats {
    pub total: usize,
    pub open: usize,
    /// Open tickets holding a live lease (subset of `open`).
    pub in_progress: usize,
    pub completed: usize,
    /// Open tickets per priority band.
    pub by_priority: BTreeMap<Priority, usize>,
}
