//! Lease-based exclusive locks on tickets.
//!
//! A lease is granted for a fixed duration and lapses on its own; nothing
//! sweeps in the background. Expiry is evaluated on demand by the next
//! acquire, dispatch or cleanup call.
//!
//! Every mutating path here runs in a [`TxMode::Reserving`] transaction, so
//! the eligibility check and the write cannot be split by another writer.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::{
    clock::SharedClock,
    events::{EventBus, EventType, TicketEvent},
    repository::{fetch_ticket, require_ticket},
    store::{from_millis, to_millis, Store, TxMode},
    ticket::{LockInfo, TicketId, TicketStatus},
    Error, Result,
};

/// Lock granted to an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDescriptor {
    /// Ticket the lease covers
    pub ticket_id: TicketId,
    /// Actor holding the lease
    pub locked_by: String,
    /// When the lease was first granted; renewals keep it
    pub locked_at: DateTime<Utc>,
    /// Last instant the lease is live
    pub lease_expires: DateTime<Utc>,
}

/// Why a lock could not be granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Another live lease covers the ticket
    HeldBy {
        /// Current holder
        actor: String,
        /// When the holder's lease lapses
        lease_expires: DateTime<Utc>,
    },
    /// Completed tickets are never locked again
    Completed,
}

/// Result of an acquire attempt. Unavailability is an ordinary outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Acquired(LockDescriptor),
    Unavailable(UnavailableReason),
}

impl AcquireOutcome {
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    #[must_use]
    pub const fn lock(&self) -> Option<&LockDescriptor> {
        match self {
            Self::Acquired(lock) => Some(lock),
            Self::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenewOutcome {
    Renewed(LockDescriptor),
    /// The caller no longer owns the ticket and must stop working on it.
    NotHeld,
}

/// Lock fields of a ticket as seen at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub ticket_id: TicketId,
    pub status: TicketStatus,
    /// Stored lock fields, lapsed or not
    pub lock: Option<LockInfo>,
    /// Whether `lock` is still within its lease
    pub live: bool,
}

/// A lease cleared because it had lapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReclaimedLease {
    pub ticket_id: TicketId,
    pub previous_holder: String,
    pub lease_expires: DateTime<Utc>,
}

/// Outcome of [`try_lock_in`], plus the lapsed holder it displaced, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LockAttempt {
    pub outcome: AcquireOutcome,
    pub displaced: Option<String>,
}

pub(crate) fn validate_lease_request(actor: &str, lease: Duration) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(Error::InvalidInput("actor must not be empty".into()));
    }
    if lease <= Duration::zero() {
        return Err(Error::InvalidInput(format!(
            "lease must be positive, got {}ms",
            lease.num_milliseconds()
        )));
    }
    Ok(())
}

/// `now + lease`, refusing leases that run past the representable range.
pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(lease).ok_or_else(|| {
        Error::InvalidInput(format!(
            "lease of {}s runs past the latest representable time",
            lease.num_seconds()
        ))
    })
}

/// Clear every lapsed lease. Must run inside a reserving transaction.
pub(crate) async fn reclaim_expired_in(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<Vec<ReclaimedLease>> {
    let now_ms = to_millis(now);
    let lapsed: Vec<(i64, String, i64)> = sqlx::query_as(
        "SELECT id, locked_by, lease_expires FROM tickets \
         WHERE locked_by IS NOT NULL AND lease_expires < ? ORDER BY id",
    )
    .bind(now_ms)
    .fetch_all(&mut *conn)
    .await?;

    if lapsed.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query(
        "UPDATE tickets SET locked_by = NULL, locked_at = NULL, lease_expires = NULL, \
         updated_at = ? WHERE locked_by IS NOT NULL AND lease_expires < ?",
    )
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    lapsed
        .into_iter()
        .map(|(id, previous_holder, lease_expires)| {
            Ok(ReclaimedLease {
                ticket_id: TicketId::new(id),
                previous_holder,
                lease_expires: from_millis(lease_expires)?,
            })
        })
        .collect()
}

/// Check eligibility and write the lease in the caller's reserving
/// transaction.
pub(crate) async fn try_lock_in(
    conn: &mut SqliteConnection,
    id: TicketId,
    actor: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<LockAttempt> {
    let ticket = require_ticket(conn, id).await?;

    if ticket.is_completed() {
        return Ok(LockAttempt {
            outcome: AcquireOutcome::Unavailable(UnavailableReason::Completed),
            displaced: None,
        });
    }

    let displaced = match ticket.lock {
        Some(lock) if lock.is_live_at(now) => {
            return Ok(LockAttempt {
                outcome: AcquireOutcome::Unavailable(UnavailableReason::HeldBy {
                    actor: lock.locked_by,
                    lease_expires: lock.lease_expires,
                }),
                displaced: None,
            });
        }
        Some(lapsed) => Some(lapsed.locked_by),
        None => None,
    };

    let lease_expires = lease_expiry(now, lease)?;
    let written = sqlx::query(
        "UPDATE tickets SET locked_by = ?, locked_at = ?, lease_expires = ?, updated_at = ? \
         WHERE id = ? AND deleted = 0 AND status = 'open' \
         AND (locked_by IS NULL OR lease_expires < ?)",
    )
    .bind(actor)
    .bind(to_millis(now))
    .bind(to_millis(lease_expires))
    .bind(to_millis(now))
    .bind(id.get())
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    if written.rows_affected() != 1 {
        return Err(Error::Contention(format!(
            "Ticket {id} changed between eligibility check and lock write"
        )));
    }

    Ok(LockAttempt {
        outcome: AcquireOutcome::Acquired(LockDescriptor {
            ticket_id: id,
            locked_by: actor.to_string(),
            locked_at: now,
            lease_expires,
        }),
        displaced,
    })
}

pub(crate) fn emit_reclaimed(events: &EventBus, reclaimed: &[ReclaimedLease], now: DateTime<Utc>) {
    for lease in reclaimed {
        events.emit(
            TicketEvent::new(EventType::LockExpiredReclaimed, now)
                .with_ticket(lease.ticket_id)
                .with_actor(&lease.previous_holder)
                .with_data(serde_json::json!({ "lease_expires": lease.lease_expires })),
        );
    }
}

pub(crate) fn emit_acquired(events: &EventBus, attempt: &LockAttempt, now: DateTime<Utc>) {
    if let AcquireOutcome::Acquired(lock) = &attempt.outcome {
        if let Some(previous) = &attempt.displaced {
            events.emit(
                TicketEvent::new(EventType::LockExpiredReclaimed, now)
                    .with_ticket(lock.ticket_id)
                    .with_actor(previous),
            );
        }
        events.emit(
            TicketEvent::new(EventType::LockAcquired, now)
                .with_ticket(lock.ticket_id)
                .with_actor(&lock.locked_by)
                .with_data(serde_json::json!({ "lease_expires": lock.lease_expires })),
        );
    }
}

/// Manages ticket leases backed by `SQLite`.
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Store,
    clock: SharedClock,
    events: EventBus,
}

impl LockManager {
    #[must_use]
    pub const fn new(store: Store, clock: SharedClock, events: EventBus) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Lock `id` for `actor` if it is unlocked or its lease has lapsed.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown ticket, [`Error::Contention`] if the
    /// reservation could not be taken within the busy timeout.
    pub async fn acquire(&self, id: TicketId, actor: &str, lease: Duration) -> Result<AcquireOutcome> {
        validate_lease_request(actor, lease)?;

        let mut tx = self.store.begin(TxMode::Reserving).await?;
        let now = self.clock.now();
        let result = match tx.conn() {
            Ok(conn) => try_lock_in(conn, id, actor, lease, now).await,
            Err(e) => Err(e),
        };
        let attempt = tx.finish(result).await?;

        emit_acquired(&self.events, &attempt, now);
        if let AcquireOutcome::Unavailable(reason) = &attempt.outcome {
            tracing::debug!(ticket_id = id.get(), actor, ?reason, "lock unavailable");
        }
        Ok(attempt.outcome)
    }

    /// Extend the caller's lease to `now + lease`.
    ///
    /// A renewal never shortens a lease: if the current expiry is already
    /// later than `now + lease` it is kept. A holder whose lease has lapsed
    /// but not yet been reclaimed may still renew; once anyone else has taken
    /// the ticket the answer is [`RenewOutcome::NotHeld`].
    pub async fn renew(&self, id: TicketId, actor: &str, lease: Duration) -> Result<RenewOutcome> {
        validate_lease_request(actor, lease)?;

        let mut tx = self.store.begin(TxMode::Reserving).await?;
        let now = self.clock.now();
        let result: Result<RenewOutcome> = async {
            let requested = lease_expiry(now, lease)?;
            let conn = tx.conn()?;
            let ticket = require_ticket(conn, id).await?;
            let Some(lock) = ticket.lock.filter(|l| l.locked_by == actor) else {
                return Ok(RenewOutcome::NotHeld);
            };
            let lease_expires = requested.max(lock.lease_expires);

            sqlx::query(
                "UPDATE tickets SET lease_expires = ?, updated_at = ? \
                 WHERE id = ? AND locked_by = ? AND deleted = 0",
            )
            .bind(to_millis(lease_expires))
            .bind(to_millis(now))
            .bind(id.get())
            .bind(actor)
            .execute(&mut *conn)
            .await?;

            Ok(RenewOutcome::Renewed(LockDescriptor {
                ticket_id: id,
                locked_by: lock.locked_by,
                locked_at: lock.locked_at,
                lease_expires,
            }))
        }
        .await;
        let outcome = tx.finish(result).await?;

        match &outcome {
            RenewOutcome::Renewed(lock) => self.events.emit(
                TicketEvent::new(EventType::LockRenewed, now)
                    .with_ticket(id)
                    .with_actor(actor)
                    .with_data(serde_json::json!({ "lease_expires": lock.lease_expires })),
            ),
            RenewOutcome::NotHeld => {
                tracing::warn!(ticket_id = id.get(), actor, "renew refused: lock not held");
            }
        }
        Ok(outcome)
    }

    /// Clear the lock if `actor` holds it. Returns whether anything changed;
    /// a release by anyone else leaves the current holder untouched.
    pub async fn release(&self, id: TicketId, actor: &str) -> Result<bool> {
        let now = self.clock.now();

        let mut tx = self.store.begin(TxMode::Reserving).await?;
        let result: Result<bool> = async {
            let conn = tx.conn()?;
            let cleared = sqlx::query(
                "UPDATE tickets SET locked_by = NULL, locked_at = NULL, lease_expires = NULL, \
                 updated_at = ? WHERE id = ? AND locked_by = ? AND deleted = 0",
            )
            .bind(to_millis(now))
            .bind(id.get())
            .bind(actor)
            .execute(&mut *conn)
            .await?;

            if cleared.rows_affected() == 0 {
                require_ticket(conn, id).await?;
                return Ok(false);
            }
            Ok(true)
        }
        .await;
        let released = tx.finish(result).await?;

        if released {
            self.events.emit(
                TicketEvent::new(EventType::LockReleased, now)
                    .with_ticket(id)
                    .with_actor(actor),
            );
        } else {
            tracing::debug!(ticket_id = id.get(), actor, "release ignored: not the holder");
        }
        Ok(released)
    }

    /// Clear every lapsed lease. Idempotent; returns how many were cleared.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = self.clock.now();

        let mut tx = self.store.begin(TxMode::Reserving).await?;
        let result = match tx.conn() {
            Ok(conn) => reclaim_expired_in(conn, now).await,
            Err(e) => Err(e),
        };
        let reclaimed = tx.finish(result).await?;

        emit_reclaimed(&self.events, &reclaimed, now);
        Ok(reclaimed.len())
    }

    /// Current lock fields of a ticket, evaluated against the clock.
    pub async fn lock_state(&self, id: TicketId) -> Result<LockState> {
        let now = self.clock.now();
        let mut conn = self.store.pool().acquire().await?;
        let ticket = fetch_ticket(&mut conn, id)
            .await?
            .ok_or(Error::NotFound { id })?;

        Ok(LockState {
            ticket_id: id,
            status: ticket.status,
            live: ticket.lock.as_ref().is_some_and(|l| l.is_live_at(now)),
            lock: ticket.lock,
        })
    }
}
