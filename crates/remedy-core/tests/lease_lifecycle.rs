//! Lease lifecycle through the service facade with a manual clock.
//!
//! Covers expiry at the lease boundary, renewal, release by a stranger,
//! crash recovery through dispatch and completion idempotency.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::doc_markdown)]

use std::sync::Arc;

use chrono::Duration;
use remedy_core::{
    AcquireOutcome, CompletionEvidence, Error, EventType, ManualClock, NewTicket, Priority,
    RemedyConfig, RenewOutcome, Store, TicketId, TicketService, TicketStatus, UnavailableReason,
};

async fn setup() -> (TicketService, ManualClock) {
    let clock = ManualClock::starting_now();
    let store = Store::open_in_memory().await.unwrap();
    let service = TicketService::new(store, &RemedyConfig::default(), Arc::new(clock.clone()));
    (service, clock)
}

async fn open_ticket(service: &TicketService, priority: Priority) -> TicketId {
    service
        .create_ticket(&NewTicket::new(priority, "PanicError", "index out of bounds", "api"))
        .await
        .unwrap()
        .id
}

fn evidence() -> CompletionEvidence {
    CompletionEvidence::new(
        "Bounds-checked the slice before indexing",
        "ran unit tests",
        "42 passed, 0 failed",
    )
}

#[tokio::test]
async fn test_lease_blocks_until_expiry_then_frees() {
    let (service, clock) = setup().await;
    let id = open_ticket(&service, Priority::P1).await;
    let lease = Some(Duration::seconds(30));

    assert!(service.acquire_lock(id, "a", lease).await.unwrap().is_acquired());

    clock.advance(Duration::seconds(30));
    let blocked = service.acquire_lock(id, "b", lease).await.unwrap();
    assert!(matches!(
        blocked,
        AcquireOutcome::Unavailable(UnavailableReason::HeldBy { .. })
    ));

    clock.advance(Duration::milliseconds(1));
    assert!(service.acquire_lock(id, "b", lease).await.unwrap().is_acquired());
}

#[tokio::test]
async fn test_renewed_lease_outlives_original_expiry() {
    let (service, clock) = setup().await;
    let id = open_ticket(&service, Priority::P2).await;
    let lease = Some(Duration::seconds(30));

    service.acquire_lock(id, "a", lease).await.unwrap();
    clock.advance(Duration::seconds(29));
    let renewed = service.renew_lock(id, "a", lease).await.unwrap();
    assert!(matches!(renewed, RenewOutcome::Renewed(_)));

    clock.advance(Duration::seconds(2));
    assert!(!service.acquire_lock(id, "b", lease).await.unwrap().is_acquired());
    assert_eq!(service.get_ticket(id).await.unwrap().locked_by(), Some("a"));
}

#[tokio::test]
async fn test_release_by_non_owner_leaves_lock_intact() {
    let (service, _clock) = setup().await;
    let id = open_ticket(&service, Priority::P0).await;
    service.acquire_lock(id, "a", None).await.unwrap();

    assert!(!service.release_lock(id, "b").await.unwrap());
    assert_eq!(service.get_ticket(id).await.unwrap().locked_by(), Some("a"));
}

#[tokio::test]
async fn test_crashed_worker_ticket_is_redispatched() {
    let (service, clock) = setup().await;
    let id = open_ticket(&service, Priority::P1).await;
    let lease = Some(Duration::seconds(10));

    let first = service
        .get_and_lock_next_ticket("crashy", lease, None)
        .await
        .unwrap();
    assert_eq!(first.map(|t| t.id), Some(id));

    // No release, no cleanup: only time passes.
    clock.advance(Duration::seconds(11));
    let mut events = service.subscribe();
    let rescued = service
        .get_and_lock_next_ticket("rescuer", lease, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rescued.id, id);
    assert_eq!(rescued.locked_by(), Some("rescuer"));

    let reclaimed = events.try_recv().unwrap();
    assert_eq!(reclaimed.event_type, EventType::LockExpiredReclaimed);
    assert_eq!(reclaimed.actor.as_deref(), Some("crashy"));

    assert_eq!(
        service.renew_lock(id, "crashy", lease).await.unwrap(),
        RenewOutcome::NotHeld
    );
}

#[tokio::test]
async fn test_completion_is_idempotent_and_keeps_first_evidence() {
    let (service, _clock) = setup().await;
    let id = open_ticket(&service, Priority::P1).await;
    service.acquire_lock(id, "a", None).await.unwrap();

    assert!(service.mark_complete(id, &evidence()).await.unwrap());

    let later = CompletionEvidence::new(
        "Completely different explanation here",
        "other steps",
        "other results",
    );
    assert!(!service.mark_complete(id, &later).await.unwrap());

    let ticket = service.get_ticket(id).await.unwrap();
    assert_eq!(ticket.status, TicketStatus::Completed);
    assert!(ticket.lock.is_none());
    assert_eq!(
        ticket.completion.unwrap().completion_notes,
        "Bounds-checked the slice before indexing"
    );
}

#[tokio::test]
async fn test_completion_notes_boundary() {
    let (service, _clock) = setup().await;
    let id = open_ticket(&service, Priority::P3).await;

    let nineteen = CompletionEvidence::new("x".repeat(19), "ran unit tests", "42 passed, 0 failed");
    assert_eq!(
        service.mark_complete(id, &nineteen).await,
        Err(Error::ValidationFailed {
            field: "completion_notes",
            required_min: 20,
            actual: 19
        })
    );
    assert_eq!(
        service.get_ticket(id).await.unwrap().status,
        TicketStatus::Open
    );

    let twenty = CompletionEvidence::new("x".repeat(20), "ran unit tests", "42 passed, 0 failed");
    assert!(service.mark_complete(id, &twenty).await.unwrap());
}

#[tokio::test]
async fn test_capacity_cap_counts_only_active_tickets() {
    let clock = ManualClock::starting_now();
    let store = Store::open_in_memory().await.unwrap();
    let mut config = RemedyConfig::default();
    config.capacity.max_active_tickets = 2;
    let service = TicketService::new(store, &config, Arc::new(clock));

    let first = open_ticket(&service, Priority::P1).await;
    open_ticket(&service, Priority::P1).await;
    let refused = service
        .create_ticket(&NewTicket::new(Priority::P0, "E", "m", "api"))
        .await;
    assert!(matches!(refused, Err(Error::CapacityExceeded { .. })));

    assert!(service.mark_complete(first, &evidence()).await.unwrap());
    open_ticket(&service, Priority::P1).await;
    assert_eq!(service.get_stats().await.unwrap().total, 3);
}
