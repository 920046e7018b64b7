//! # Remedy Core
//!
//! Concurrency-control and dispatch engine for remediation tickets claimed
//! by many independent workers over one shared `SQLite` store.
//!
//! - Lease-based exclusive locks that lapse on their own
//! - Atomic priority + FIFO select-and-lock dispatch
//! - A completion gate that refuses thin evidence
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` - returns `Result` instead
//! - No `expect()` - returns `Result` instead
//! - No `panic!()` - returns `Result` instead
//! - No `unsafe` - safe Rust only
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, Error>`. Lock contention is
//! not an error: it is reported as [`AcquireOutcome::Unavailable`].

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod clock;
pub mod completion;
pub mod config;
pub mod dispatch;
mod error;
pub mod events;
pub mod locks;
pub mod repository;
pub mod retry;
pub mod service;
pub mod store;
pub mod ticket;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use completion::{
    CompletionEvidence, CompletionGate, MIN_COMPLETION_NOTES, MIN_TEST_RESULTS, MIN_TEST_STEPS,
};
pub use config::RemedyConfig;
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use events::{EventBus, EventType, TicketEvent};
pub use locks::{
    AcquireOutcome, LockDescriptor, LockManager, LockState, RenewOutcome, UnavailableReason,
};
pub use repository::TicketRepository;
pub use retry::RetryPolicy;
pub use service::TicketService;
pub use store::{Store, StoreTx, TxMode};
pub use ticket::{
    CompletionMetadata, CompletionRecord, FileContext, LockInfo, NewTicket, Priority, Ticket,
    TicketFilter, TicketId, TicketStats, TicketStatus, TicketUpdate,
};
