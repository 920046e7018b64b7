//! Atomic select-and-lock of the next ticket to work on.

use chrono::Duration;
use sqlx::{QueryBuilder, Sqlite};

use crate::{
    clock::SharedClock,
    events::EventBus,
    locks::{
        emit_acquired, emit_reclaimed, reclaim_expired_in, try_lock_in, validate_lease_request,
        AcquireOutcome, LockAttempt, ReclaimedLease,
    },
    repository::{push_priority_filter, require_ticket},
    store::{to_millis, Store, TxMode},
    ticket::{Priority, Ticket, TicketId},
    Error, Result,
};

/// Hands out work one ticket at a time.
///
/// Each call reclaims lapsed leases, picks the most urgent eligible ticket
/// (priority, then oldest first) and locks it, all in one reserving
/// transaction. Two concurrent calls can never return the same ticket.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Store,
    clock: SharedClock,
    events: EventBus,
}

#[derive(Debug)]
struct Dispatched {
    reclaimed: Vec<ReclaimedLease>,
    claim: Option<(Ticket, LockAttempt)>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(store: Store, clock: SharedClock, events: EventBus) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Lock and return the next ticket for `actor`, or `None` when no
    /// eligible ticket matches.
    ///
    /// An empty `priority_filter` slice behaves like `None`.
    pub async fn get_and_lock_next_ticket(
        &self,
        actor: &str,
        lease: Duration,
        priority_filter: Option<&[Priority]>,
    ) -> Result<Option<Ticket>> {
        validate_lease_request(actor, lease)?;
        let priorities = priority_filter.unwrap_or_default();

        let mut tx = self.store.begin(TxMode::Reserving).await?;
        let now = self.clock.now();
        let result: Result<Dispatched> = async {
            let conn = tx.conn()?;
            let reclaimed = reclaim_expired_in(conn, now).await?;

            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT id FROM tickets WHERE deleted = 0 AND status = 'open' \
                 AND (locked_by IS NULL OR lease_expires < ",
            );
            qb.push_bind(to_millis(now)).push(")");
            push_priority_filter(&mut qb, priorities);
            qb.push(" ORDER BY priority ASC, created_at ASC, id ASC LIMIT 1");

            let next: Option<(i64,)> = qb.build_query_as().fetch_optional(&mut *conn).await?;
            let Some((id,)) = next else {
                return Ok(Dispatched {
                    reclaimed,
                    claim: None,
                });
            };

            let id = TicketId::new(id);
            let attempt = try_lock_in(conn, id, actor, lease, now).await?;
            if !attempt.outcome.is_acquired() {
                return Err(Error::Contention(format!(
                    "Ticket {id} selected for dispatch but not lockable"
                )));
            }
            let ticket = require_ticket(conn, id).await?;
            Ok(Dispatched {
                reclaimed,
                claim: Some((ticket, attempt)),
            })
        }
        .await;
        let dispatched = tx.finish(result).await?;

        emit_reclaimed(&self.events, &dispatched.reclaimed, now);
        match dispatched.claim {
            Some((ticket, attempt)) => {
                emit_acquired(&self.events, &attempt, now);
                if let AcquireOutcome::Acquired(lock) = &attempt.outcome {
                    tracing::debug!(
                        ticket_id = lock.ticket_id.get(),
                        actor,
                        priority = %ticket.priority,
                        "dispatched"
                    );
                }
                Ok(Some(ticket))
            }
            None => {
                tracing::debug!(actor, ?priority_filter, "no work available");
                Ok(None)
            }
        }
    }
}
