//! Error types for remedy-core
//!
//! Lock contention is not represented here: an unavailable lease is an
//! ordinary outcome (`AcquireOutcome::Unavailable`), never an error.

use thiserror::Error;

use crate::ticket::TicketId;

/// Core error type for ticket operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unknown (or soft-deleted) ticket
    #[error("Ticket {id} not found")]
    NotFound { id: TicketId },

    /// A text field exceeded its maximum length
    #[error("Field '{field}' is too long: {actual} characters (limit {limit})")]
    FieldTooLong {
        field: &'static str,
        limit: usize,
        actual: usize,
    },

    /// The serialized file context exceeded its byte cap
    #[error("File context is too large: {actual} bytes (limit {limit})")]
    FileContextTooLarge { limit: usize, actual: usize },

    /// Creating another ticket would exceed the active-ticket cap
    #[error("Active ticket capacity exceeded: {current} active (limit {limit})")]
    CapacityExceeded { current: usize, limit: usize },

    /// Completion evidence did not meet the quality gate
    #[error(
        "Completion validation failed: '{field}' requires at least {required_min} characters, got {actual}"
    )]
    ValidationFailed {
        field: &'static str,
        required_min: usize,
        actual: usize,
    },

    /// A single attempt lost a store-level serialization race
    #[error("Store contention: {0}")]
    Contention(String),

    /// Contention persisted through every retry
    #[error("Store busy: '{operation}' gave up after {attempts} attempts")]
    StoreBusy { operation: String, attempts: u32 },

    /// Any other store failure
    #[error("Database error: {0}")]
    Database(String),

    /// Malformed caller argument (empty actor, non-positive lease)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stored or supplied data could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Whether a fresh attempt of the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Contention(_))
    }

    /// Process exit code for this error.
    ///
    /// - 1: caller error (validation, limits, configuration)
    /// - 2: system error (IO)
    /// - 3: not found
    /// - 4: store or state error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::FieldTooLong { .. }
            | Self::FileContextTooLarge { .. }
            | Self::ValidationFailed { .. }
            | Self::InvalidInput(_)
            | Self::InvalidConfig(_)
            | Self::Parse(_) => 1,
            Self::Io(_) => 2,
            Self::NotFound { .. } => 3,
            Self::CapacityExceeded { .. }
            | Self::Contention(_)
            | Self::StoreBusy { .. }
            | Self::Database(_) => 4,
        }
    }
}

// SQLITE_BUSY and SQLITE_LOCKED with their extended codes.
const CONTENTION_CODES: &[&str] = &["5", "6", "261", "262", "517", "773"];

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Self::Contention(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let busy_code = db_err
                    .code()
                    .is_some_and(|code| CONTENTION_CODES.contains(&code.as_ref()));
                let busy_message = db_err.message().contains("database is locked");
                if busy_code || busy_message {
                    Self::Contention(db_err.message().to_string())
                } else {
                    Self::Database(err.to_string())
                }
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(format!("Failed to parse config: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias for remedy-core operations
pub type Result<T> = std::result::Result<T, Error>;
