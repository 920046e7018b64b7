//! Ticket repository: CRUD with field-length and capacity guards.
//!
//! Reads run as plain autocommit statements on the pool. Creation counts
//! active tickets and inserts in one reserving transaction so concurrent
//! creators cannot overshoot the cap. Updates and soft deletes are blind
//! single-statement writes and run optimistically.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    clock::SharedClock,
    config::FieldLimits,
    events::{EventBus, EventType, TicketEvent},
    store::{from_millis, to_millis, Store, TxMode},
    ticket::{
        CompletionMetadata, CompletionRecord, FileContext, LockInfo, NewTicket, Priority, Ticket,
        TicketFilter, TicketId, TicketStats, TicketStatus, TicketUpdate,
    },
    Error, Result,
};

pub(crate) const TICKET_COLUMNS: &str = "id, priority, status, error_type, message, source, \
     stack_trace, file_context, created_at, updated_at, locked_by, locked_at, lease_expires, \
     completion_notes, test_steps, test_results, completed_at, completion_metadata";

/// Raw `tickets` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TicketRow {
    id: i64,
    priority: i64,
    status: String,
    error_type: String,
    message: String,
    source: String,
    stack_trace: Option<String>,
    file_context: Option<String>,
    created_at: i64,
    updated_at: i64,
    locked_by: Option<String>,
    locked_at: Option<i64>,
    lease_expires: Option<i64>,
    completion_notes: Option<String>,
    test_steps: Option<String>,
    test_results: Option<String>,
    completed_at: Option<i64>,
    completion_metadata: Option<String>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = Error;

    fn try_from(row: TicketRow) -> Result<Self> {
        let status = row
            .status
            .parse::<TicketStatus>()
            .map_err(|e| Error::Parse(format!("Invalid ticket status '{}': {e}", row.status)))?;

        let lock = match (row.locked_by, row.locked_at, row.lease_expires) {
            (Some(locked_by), Some(locked_at), Some(lease_expires)) => Some(LockInfo {
                locked_by,
                locked_at: from_millis(locked_at)?,
                lease_expires: from_millis(lease_expires)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(Error::Parse(format!(
                    "Ticket {} has partially set lock fields",
                    row.id
                )))
            }
        };

        let completion = match (status, row.completed_at) {
            (TicketStatus::Completed, Some(completed_at)) => Some(CompletionRecord {
                completion_notes: row.completion_notes.unwrap_or_default(),
                test_steps: row.test_steps.unwrap_or_default(),
                test_results: row.test_results.unwrap_or_default(),
                completed_at: from_millis(completed_at)?,
                metadata: row
                    .completion_metadata
                    .as_deref()
                    .map(serde_json::from_str::<CompletionMetadata>)
                    .transpose()?
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Self {
            id: TicketId::new(row.id),
            priority: Priority::from_rank(row.priority)?,
            status,
            error_type: row.error_type,
            message: row.message,
            source: row.source,
            stack_trace: row.stack_trace,
            file_context: row
                .file_context
                .as_deref()
                .map(FileContext::from_blob)
                .transpose()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            lock,
            completion,
        })
    }
}

/// Load a live (non-deleted) ticket inside an open transaction.
pub(crate) async fn fetch_ticket(conn: &mut SqliteConnection, id: TicketId) -> Result<Option<Ticket>> {
    let row: Option<TicketRow> = sqlx::query_as(&format!(
        "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ? AND deleted = 0"
    ))
    .bind(id.get())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Ticket::try_from).transpose()
}

/// Like [`fetch_ticket`], but absence is an error.
pub(crate) async fn require_ticket(conn: &mut SqliteConnection, id: TicketId) -> Result<Ticket> {
    fetch_ticket(conn, id)
        .await?
        .ok_or(Error::NotFound { id })
}

/// Append `AND priority IN (...)` when `priorities` is non-empty.
pub(crate) fn push_priority_filter(qb: &mut QueryBuilder<'_, Sqlite>, priorities: &[Priority]) {
    if priorities.is_empty() {
        return;
    }
    qb.push(" AND priority IN (");
    let mut separated = qb.separated(", ");
    for priority in priorities {
        separated.push_bind(priority.rank());
    }
    separated.push_unseparated(")");
}

/// Tickets that are neither completed nor soft-deleted.
async fn count_active(conn: &mut SqliteConnection) -> Result<usize> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tickets WHERE deleted = 0 AND status <> 'completed'",
    )
    .fetch_one(&mut *conn)
    .await?;
    usize::try_from(count).map_err(|e| Error::Parse(format!("Invalid ticket count: {e}")))
}

#[derive(Debug, Clone)]
pub struct TicketRepository {
    store: Store,
    clock: SharedClock,
    events: EventBus,
    limits: FieldLimits,
    max_active_tickets: usize,
}

impl TicketRepository {
    #[must_use]
    pub const fn new(
        store: Store,
        clock: SharedClock,
        events: EventBus,
        limits: FieldLimits,
        max_active_tickets: usize,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            limits,
            max_active_tickets,
        }
    }

    #[must_use]
    pub const fn limits(&self) -> &FieldLimits {
        &self.limits
    }

    /// Insert a new Open, unlocked ticket and return it with its id.
    pub async fn create(&self, ticket: &NewTicket) -> Result<Ticket> {
        let file_context = self.validate_new(ticket)?;
        let now = self.clock.now();

        let mut tx = self.store.begin(TxMode::Reserving).await?;
        let result = self
            .insert_within_cap(tx.conn()?, ticket, file_context.as_deref(), now)
            .await;
        let outcome = tx.finish(result).await;

        match &outcome {
            Ok(created) => self.events.emit(
                TicketEvent::new(EventType::TicketCreated, now)
                    .with_ticket(created.id)
                    .with_actor(&created.source)
                    .with_data(serde_json::json!({ "priority": created.priority })),
            ),
            Err(Error::CapacityExceeded { current, limit }) => self.events.emit(
                TicketEvent::new(EventType::CapacityExceeded, now)
                    .with_actor(&ticket.source)
                    .with_data(serde_json::json!({ "current": current, "limit": limit })),
            ),
            Err(_) => {}
        }
        outcome
    }

    async fn insert_within_cap(
        &self,
        conn: &mut SqliteConnection,
        ticket: &NewTicket,
        file_context: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Ticket> {
        let current = count_active(conn).await?;
        if current >= self.max_active_tickets {
            return Err(Error::CapacityExceeded {
                current,
                limit: self.max_active_tickets,
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO tickets (priority, status, error_type, message, source, stack_trace, \
             file_context, created_at, updated_at) VALUES (?, 'open', ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ticket.priority.rank())
        .bind(&ticket.error_type)
        .bind(&ticket.message)
        .bind(&ticket.source)
        .bind(ticket.stack_trace.as_deref())
        .bind(file_context)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        require_ticket(conn, TicketId::new(inserted.last_insert_rowid())).await
    }

    fn validate_new(&self, ticket: &NewTicket) -> Result<Option<String>> {
        let limits = &self.limits;
        FieldLimits::check("error_type", &ticket.error_type, limits.error_type)?;
        FieldLimits::check("message", &ticket.message, limits.message)?;
        FieldLimits::check("source", &ticket.source, limits.source)?;
        if let Some(stack_trace) = &ticket.stack_trace {
            FieldLimits::check("stack_trace", stack_trace, limits.stack_trace)?;
        }
        ticket
            .file_context
            .as_ref()
            .map(|ctx| ctx.to_blob(limits.file_context_max_bytes))
            .transpose()
    }

    pub async fn get(&self, id: TicketId) -> Result<Ticket> {
        let mut conn = self.store.pool().acquire().await?;
        require_ticket(&mut conn, id).await
    }

    /// Apply a partial text update. Every supplied field is checked before
    /// anything is written.
    pub async fn update(&self, id: TicketId, update: &TicketUpdate) -> Result<Ticket> {
        let limits = &self.limits;
        if let Some(value) = &update.error_type {
            FieldLimits::check("error_type", value, limits.error_type)?;
        }
        if let Some(value) = &update.message {
            FieldLimits::check("message", value, limits.message)?;
        }
        if let Some(value) = &update.source {
            FieldLimits::check("source", value, limits.source)?;
        }
        if let Some(value) = &update.stack_trace {
            FieldLimits::check("stack_trace", value, limits.stack_trace)?;
        }
        let file_context = update
            .file_context
            .as_ref()
            .map(|ctx| ctx.to_blob(limits.file_context_max_bytes))
            .transpose()?;

        if update.is_empty() {
            return self.get(id).await;
        }

        let now = self.clock.now();
        let mut tx = self.store.begin(TxMode::Optimistic).await?;
        let result: Result<Ticket> = async {
            let conn = tx.conn()?;
            let updated = sqlx::query(
                "UPDATE tickets SET \
                 error_type = COALESCE(?, error_type), \
                 message = COALESCE(?, message), \
                 source = COALESCE(?, source), \
                 stack_trace = COALESCE(?, stack_trace), \
                 file_context = COALESCE(?, file_context), \
                 updated_at = ? \
                 WHERE id = ? AND deleted = 0",
            )
            .bind(update.error_type.as_deref())
            .bind(update.message.as_deref())
            .bind(update.source.as_deref())
            .bind(update.stack_trace.as_deref())
            .bind(file_context.as_deref())
            .bind(to_millis(now))
            .bind(id.get())
            .execute(&mut *conn)
            .await?;

            if updated.rows_affected() == 0 {
                return Err(Error::NotFound { id });
            }
            require_ticket(conn, id).await
        }
        .await;
        tx.finish(result).await
    }

    /// Tickets matching `filter`, most urgent first, FIFO within a band.
    pub async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE deleted = 0"
        ));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        push_priority_filter(&mut qb, &filter.priorities);
        if let Some(locked) = filter.locked {
            qb.push(if locked {
                " AND locked_by IS NOT NULL"
            } else {
                " AND locked_by IS NULL"
            });
        }
        qb.push(" ORDER BY priority ASC, created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<TicketRow> = qb.build_query_as().fetch_all(self.store.pool()).await?;
        rows.into_iter().map(Ticket::try_from).collect()
    }

    /// Counts by status and priority. A lease counts as in progress only
    /// while it is live.
    pub async fn stats(&self) -> Result<TicketStats> {
        let now = to_millis(self.clock.now());
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT status, priority, COUNT(*), \
             SUM(CASE WHEN locked_by IS NOT NULL AND lease_expires >= ? THEN 1 ELSE 0 END) \
             FROM tickets WHERE deleted = 0 GROUP BY status, priority",
        )
        .bind(now)
        .fetch_all(self.store.pool())
        .await?;

        let mut stats = TicketStats::default();
        for (status, rank, count, live) in rows {
            let count = usize::try_from(count)
                .map_err(|e| Error::Parse(format!("Invalid ticket count: {e}")))?;
            let live = usize::try_from(live)
                .map_err(|e| Error::Parse(format!("Invalid lease count: {e}")))?;
            stats.total += count;
            match status.parse::<TicketStatus>() {
                Ok(TicketStatus::Open) => {
                    stats.open += count;
                    stats.in_progress += live;
                    *stats
                        .by_priority
                        .entry(Priority::from_rank(rank)?)
                        .or_default() += count;
                }
                Ok(TicketStatus::Completed) => stats.completed += count,
                Err(e) => {
                    return Err(Error::Parse(format!("Invalid ticket status '{status}': {e}")))
                }
            }
        }
        Ok(stats)
    }

    /// Hide a ticket from every query and free any lease it holds.
    ///
    /// Returns `false` if the ticket was already deleted or never existed.
    pub async fn soft_delete(&self, id: TicketId) -> Result<bool> {
        let now = to_millis(self.clock.now());
        let mut tx = self.store.begin(TxMode::Optimistic).await?;
        let result: Result<bool> = async {
            let deleted = sqlx::query(
                "UPDATE tickets SET deleted = 1, locked_by = NULL, locked_at = NULL, \
                 lease_expires = NULL, updated_at = ? WHERE id = ? AND deleted = 0",
            )
            .bind(now)
            .bind(id.get())
            .execute(tx.conn()?)
            .await?;
            Ok(deleted.rows_affected() > 0)
        }
        .await;
        let deleted = tx.finish(result).await?;
        if deleted {
            tracing::info!(ticket_id = %id, "Ticket soft-deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::clock::ManualClock;

    async fn setup(max_active: usize) -> Result<(TicketRepository, ManualClock, EventBus)> {
        let store = Store::open_in_memory().await?;
        let clock = ManualClock::starting_now();
        let events = EventBus::new();
        let repo = TicketRepository::new(
            store,
            Arc::new(clock.clone()),
            events.clone(),
            FieldLimits::default(),
            max_active,
        );
        Ok((repo, clock, events))
    }

    fn sample(priority: Priority, message: &str) -> NewTicket {
        NewTicket::new(priority, "TypeError", message, "web-frontend")
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_starts_open_unlocked() -> Result<()> {
        let (repo, _clock, _events) = setup(10).await?;
        let ticket = repo
            .create(
                &sample(Priority::P2, "x is undefined")
                    .with_stack_trace("at main.js:10")
                    .with_file_context(FileContext::new().with("main.js", "let x;")),
            )
            .await?;

        assert_eq!(ticket.status, TicketStatus::Open);
        assert!(ticket.lock.is_none());
        assert!(ticket.completion.is_none());
        assert_eq!(ticket.stack_trace.as_deref(), Some("at main.js:10"));
        assert_eq!(
            ticket.file_context.as_ref().and_then(|c| c.get("main.js")),
            Some("let x;")
        );
        assert_eq!(repo.get(ticket.id).await?, ticket);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_over_capacity_and_emits_event() -> Result<()> {
        let (repo, _clock, events) = setup(2).await?;
        let mut rx = events.subscribe();
        repo.create(&sample(Priority::P1, "one")).await?;
        repo.create(&sample(Priority::P1, "two")).await?;

        let result = repo.create(&sample(Priority::P1, "three")).await;
        assert_eq!(
            result,
            Err(Error::CapacityExceeded {
                current: 2,
                limit: 2
            })
        );
        assert_eq!(repo.stats().await?.total, 2);

        let kinds: Vec<EventType> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventType::TicketCreated,
                EventType::TicketCreated,
                EventType::CapacityExceeded
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_soft_deleted_tickets_free_capacity() -> Result<()> {
        let (repo, _clock, _events) = setup(1).await?;
        let first = repo.create(&sample(Priority::P1, "one")).await?;
        assert!(repo.soft_delete(first.id).await?);
        assert!(!repo.soft_delete(first.id).await?);

        repo.create(&sample(Priority::P1, "two")).await?;
        assert_eq!(repo.get(first.id).await, Err(Error::NotFound { id: first.id }));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rejects_long_field_without_writing() -> Result<()> {
        let (repo, _clock, _events) = setup(10).await?;
        let long_source = "s".repeat(501);
        let result = repo
            .create(&NewTicket::new(Priority::P0, "E", "m", long_source))
            .await;

        assert_eq!(
            result,
            Err(Error::FieldTooLong {
                field: "source",
                limit: 500,
                actual: 501
            })
        );
        assert!(repo.list(&TicketFilter::default()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_validates_before_writing() -> Result<()> {
        let (repo, clock, _events) = setup(10).await?;
        let ticket = repo.create(&sample(Priority::P3, "original")).await?;
        clock.advance(Duration::seconds(5));

        let too_long = TicketUpdate {
            message: Some("updated".into()),
            error_type: Some("e".repeat(201)),
            ..TicketUpdate::default()
        };
        assert!(matches!(
            repo.update(ticket.id, &too_long).await,
            Err(Error::FieldTooLong {
                field: "error_type",
                ..
            })
        ));
        assert_eq!(repo.get(ticket.id).await?.message, "original");

        let ok = TicketUpdate {
            message: Some("updated".into()),
            ..TicketUpdate::default()
        };
        let updated = repo.update(ticket.id, &ok).await?;
        assert_eq!(updated.message, "updated");
        assert_eq!(updated.error_type, "TypeError");
        assert_eq!(updated.created_at, ticket.created_at);
        assert!(updated.updated_at > ticket.updated_at);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_unknown_ticket_is_not_found() -> Result<()> {
        let (repo, _clock, _events) = setup(10).await?;
        let update = TicketUpdate {
            message: Some("m".into()),
            ..TicketUpdate::default()
        };
        let missing = TicketId::new(404);
        assert_eq!(
            repo.update(missing, &update).await,
            Err(Error::NotFound { id: missing })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_list_orders_by_priority_then_fifo() -> Result<()> {
        let (repo, clock, _events) = setup(10).await?;
        let a = repo.create(&sample(Priority::P2, "a")).await?;
        clock.advance(Duration::seconds(1));
        let b = repo.create(&sample(Priority::P0, "b")).await?;
        clock.advance(Duration::seconds(1));
        let c = repo.create(&sample(Priority::P2, "c")).await?;
        clock.advance(Duration::seconds(1));
        let d = repo.create(&sample(Priority::P1, "d")).await?;

        let ids: Vec<TicketId> = repo
            .list(&TicketFilter::default())
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![b.id, d.id, a.id, c.id]);

        let p2_only: Vec<TicketId> = repo
            .list(&TicketFilter::open().with_priorities([Priority::P2]).with_limit(1))
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(p2_only, vec![a.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_context_over_cap_is_rejected() -> Result<()> {
        let (repo, _clock, _events) = setup(10).await?;
        let huge = FileContext::new().with("blob", "x".repeat(70 * 1024));
        let result = repo
            .create(&sample(Priority::P1, "m").with_file_context(huge))
            .await;
        assert!(matches!(result, Err(Error::FileContextTooLarge { limit: 65_536, .. })));
        Ok(())
    }
}
