//! Facade used by workers and the CLI.
//!
//! Wires the components over one store, clock and event bus, fills in the
//! configured default lease, and retries every store call on transient
//! contention.

use chrono::Duration;
use tokio::sync::broadcast;

use crate::{
    clock::{SharedClock, SystemClock},
    completion::{CompletionEvidence, CompletionGate},
    config::RemedyConfig,
    dispatch::Dispatcher,
    events::{EventBus, TicketEvent},
    locks::{AcquireOutcome, LockManager, LockState, RenewOutcome},
    repository::TicketRepository,
    retry::{retry_transient, RetryPolicy},
    store::Store,
    ticket::{NewTicket, Priority, Ticket, TicketFilter, TicketId, TicketStats, TicketUpdate},
    Error, Result,
};

#[derive(Debug, Clone)]
pub struct TicketService {
    store: Store,
    repo: TicketRepository,
    locks: LockManager,
    dispatcher: Dispatcher,
    gate: CompletionGate,
    events: EventBus,
    retry: RetryPolicy,
    default_lease: Duration,
}

impl TicketService {
    /// Open the configured store with the system clock.
    pub async fn open(config: &RemedyConfig) -> Result<Self> {
        config.validate()?;
        let store = Store::open(&config.store).await?;
        Ok(Self::new(store, config, std::sync::Arc::new(SystemClock)))
    }

    #[must_use]
    pub fn new(store: Store, config: &RemedyConfig, clock: SharedClock) -> Self {
        let events = EventBus::new();
        Self {
            repo: TicketRepository::new(
                store.clone(),
                clock.clone(),
                events.clone(),
                config.limits.clone(),
                config.capacity.max_active_tickets,
            ),
            locks: LockManager::new(store.clone(), clock.clone(), events.clone()),
            dispatcher: Dispatcher::new(store.clone(), clock.clone(), events.clone()),
            gate: CompletionGate::new(store.clone(), clock, events.clone(), config.limits.clone()),
            store,
            events,
            retry: RetryPolicy::from(&config.retry),
            default_lease: config.lease.default_lease(),
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn default_lease(&self) -> Duration {
        self.default_lease
    }

    /// Receive lifecycle events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub const fn repository(&self) -> &TicketRepository {
        &self.repo
    }

    // ── Creation collaborator ────────────────────────────────────────────

    pub async fn create_ticket(&self, ticket: &NewTicket) -> Result<Ticket> {
        retry_transient(self.retry, "create_ticket", || self.repo.create(ticket)).await
    }

    pub async fn get_ticket(&self, id: TicketId) -> Result<Ticket> {
        retry_transient(self.retry, "get_ticket", || self.repo.get(id)).await
    }

    pub async fn update_ticket(&self, id: TicketId, update: &TicketUpdate) -> Result<Ticket> {
        retry_transient(self.retry, "update_ticket", || self.repo.update(id, update)).await
    }

    /// Soft-delete; the ticket disappears from every query and frees capacity.
    pub async fn delete_ticket(&self, id: TicketId) -> Result<bool> {
        retry_transient(self.retry, "delete_ticket", || self.repo.soft_delete(id)).await
    }

    // ── Worker collaborator ──────────────────────────────────────────────

    /// `lease` defaults to the configured lease length.
    pub async fn acquire_lock(
        &self,
        id: TicketId,
        actor: &str,
        lease: Option<Duration>,
    ) -> Result<AcquireOutcome> {
        let lease = lease.unwrap_or(self.default_lease);
        retry_transient(self.retry, "acquire_lock", || {
            self.locks.acquire(id, actor, lease)
        })
        .await
    }

    pub async fn renew_lock(
        &self,
        id: TicketId,
        actor: &str,
        lease: Option<Duration>,
    ) -> Result<RenewOutcome> {
        let lease = lease.unwrap_or(self.default_lease);
        retry_transient(self.retry, "renew_lock", || self.locks.renew(id, actor, lease)).await
    }

    pub async fn release_lock(&self, id: TicketId, actor: &str) -> Result<bool> {
        retry_transient(self.retry, "release_lock", || self.locks.release(id, actor)).await
    }

    pub async fn lock_state(&self, id: TicketId) -> Result<LockState> {
        retry_transient(self.retry, "lock_state", || self.locks.lock_state(id)).await
    }

    pub async fn get_and_lock_next_ticket(
        &self,
        actor: &str,
        lease: Option<Duration>,
        priority_filter: Option<&[Priority]>,
    ) -> Result<Option<Ticket>> {
        let lease = lease.unwrap_or(self.default_lease);
        retry_transient(self.retry, "get_and_lock_next_ticket", || {
            self.dispatcher
                .get_and_lock_next_ticket(actor, lease, priority_filter)
        })
        .await
    }

    /// Complete a ticket through the gate.
    ///
    /// Missing and already-completed tickets are reported here before the
    /// gate runs; the gate repeats the check inside its transaction, so a
    /// race between two completers still yields exactly one `true`.
    pub async fn mark_complete(&self, id: TicketId, evidence: &CompletionEvidence) -> Result<bool> {
        match self.get_ticket(id).await {
            Ok(ticket) if ticket.is_completed() => {
                tracing::info!(ticket_id = id.get(), "ticket already completed");
                return Ok(false);
            }
            Ok(_) => {}
            Err(Error::NotFound { .. }) => {
                tracing::warn!(ticket_id = id.get(), "cannot complete unknown ticket");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        retry_transient(self.retry, "mark_complete", || {
            self.gate.mark_complete(id, evidence)
        })
        .await
    }

    pub async fn cleanup_expired_locks(&self) -> Result<usize> {
        retry_transient(self.retry, "cleanup_expired_locks", || {
            self.locks.cleanup_expired()
        })
        .await
    }

    pub async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        retry_transient(self.retry, "list_tickets", || self.repo.list(filter)).await
    }

    pub async fn get_stats(&self) -> Result<TicketStats> {
        retry_transient(self.retry, "get_stats", || self.repo.stats()).await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
