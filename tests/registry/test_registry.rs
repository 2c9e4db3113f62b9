//! Unit tests for `SessionRegistry`

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use kodegen_terminal_broker::registry::eviction_reason;
use kodegen_terminal_broker::session::{AttachClaim, ConnectionHandle};
use kodegen_terminal_broker::{
    BrokerError, CloseFrame, ConnectionId, EvictionBudgets, Outbound, SessionEventKind, SessionId,
    SessionRegistry, SessionState, TerminationReason, TimerKind, TimerManager,
};

fn budgets() -> EvictionBudgets {
    EvictionBudgets {
        idle: Duration::from_secs(300),
        lifetime: Duration::from_secs(3600),
        attach_grace: Duration::from_secs(10),
    }
}

fn registry() -> SessionRegistry {
    SessionRegistry::new(TimerManager::new())
}

fn activate(registry: &SessionRegistry, id: &SessionId) {
    registry
        .with_session(id, |session| session.state = SessionState::Active)
        .unwrap();
}

#[test]
fn test_create_and_get() {
    let registry = registry();
    let id = SessionId::from("s-1");

    let snapshot = registry.create(id.clone()).unwrap();
    assert_eq!(snapshot.state, SessionState::PendingAuth);
    assert!(!snapshot.has_process);
    assert!(snapshot.credential_hash.is_none());

    assert!(registry.contains(&id));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get(&id).unwrap().id, id);
    assert!(registry.get(&SessionId::from("missing")).is_none());
}

#[test]
fn test_duplicate_id_rejected() {
    let registry = registry();
    registry.create(SessionId::from("s-1")).unwrap();
    let result = registry.create(SessionId::from("s-1"));
    assert!(matches!(result, Err(BrokerError::SessionExists(_))));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_create_bounded_respects_limit() {
    let registry = registry();
    registry.create_bounded(SessionId::from("a"), 2).unwrap();
    registry.create_bounded(SessionId::from("b"), 2).unwrap();

    let result = registry.create_bounded(SessionId::from("c"), 2);
    assert!(matches!(result, Err(BrokerError::MaxSessionsReached(2))));
    assert_eq!(registry.len(), 2);

    registry.delete(&SessionId::from("a"), TerminationReason::ClientClosed);
    assert!(registry.create_bounded(SessionId::from("c"), 2).is_ok());
}

#[test]
fn test_with_session_mutates_in_place() {
    let registry = registry();
    let id = SessionId::from("s-1");
    registry.create(id.clone()).unwrap();

    activate(&registry, &id);
    assert_eq!(registry.get(&id).unwrap().state, SessionState::Active);

    let missing = registry.with_session(&SessionId::from("nope"), |_| ());
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_delete_releases_everything_once() {
    let registry = registry();
    let mut events = registry.subscribe();
    let id = SessionId::from("s-1");
    registry.create(id.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let timers = registry.timers().clone();
    let auth = timers.schedule(&id, TimerKind::Auth, Duration::from_secs(10), |_| {});
    registry
        .with_session(&id, |session| {
            session.connection = Some(ConnectionHandle::new(ConnectionId::new(1), tx));
            session.auth_timer = Some(auth);
        })
        .unwrap();
    assert_eq!(timers.pending_for(&id), 1);

    assert!(registry.delete(&id, TerminationReason::AuthTimeout));
    assert!(!registry.contains(&id));
    assert_eq!(timers.pending_for(&id), 0);
    assert_eq!(
        rx.try_recv().unwrap(),
        Outbound::Close(CloseFrame::new(4001, "Authentication timeout"))
    );

    let event = events.try_recv().unwrap();
    assert_eq!(event.session_id, id);
    assert_eq!(event.connection_id, Some(ConnectionId::new(1)));
    assert_eq!(
        event.kind,
        SessionEventKind::Terminated(TerminationReason::AuthTimeout)
    );

    // Idempotent
    assert!(!registry.delete(&id, TerminationReason::AuthTimeout));
    assert!(rx.try_recv().is_err());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_delete_closes_claiming_connection() {
    let registry = registry();
    let id = SessionId::from("s-1");
    registry.create(id.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    registry
        .with_session(&id, |session| {
            session.state = SessionState::Attaching;
            session.attaching = Some(AttachClaim {
                connection: ConnectionHandle::new(ConnectionId::new(7), tx),
                prior_state: SessionState::Detached,
                started_at: Instant::now(),
                timer: None,
            });
        })
        .unwrap();

    registry.delete(&id, TerminationReason::Shutdown);
    assert_eq!(
        rx.try_recv().unwrap(),
        Outbound::Close(CloseFrame::new(1001, "Server shutting down"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_expired_reports_idle_sessions() {
    let registry = registry();
    let idle = SessionId::from("idle");
    let busy = SessionId::from("busy");
    let pending = SessionId::from("pending");
    for id in [&idle, &busy, &pending] {
        registry.create(id.clone()).unwrap();
    }
    activate(&registry, &idle);
    activate(&registry, &busy);

    tokio::time::advance(Duration::from_secs(200)).await;
    registry.with_session(&busy, |session| session.touch()).unwrap();
    tokio::time::advance(Duration::from_secs(150)).await;

    let expired = registry.expired(Instant::now(), budgets());
    assert_eq!(expired, vec![(idle.clone(), TerminationReason::IdleExpired)]);

    // Reporting does not delete
    assert!(registry.contains(&idle));
    assert_eq!(registry.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_lifetime_beats_activity() {
    let registry = registry();
    let id = SessionId::from("old");
    registry.create(id.clone()).unwrap();
    activate(&registry, &id);

    tokio::time::advance(Duration::from_secs(3600)).await;
    registry.with_session(&id, |session| session.touch()).unwrap();

    let reason = registry
        .with_session(&id, |session| eviction_reason(session, Instant::now(), budgets()))
        .unwrap();
    assert_eq!(reason, Some(TerminationReason::LifetimeExpired));
}

#[tokio::test(start_paused = true)]
async fn test_fresh_claim_defers_idle_eviction() {
    let registry = registry();
    let id = SessionId::from("s-1");
    registry.create(id.clone()).unwrap();
    activate(&registry, &id);

    tokio::time::advance(Duration::from_secs(400)).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    registry
        .with_session(&id, |session| {
            session.state = SessionState::Attaching;
            session.attaching = Some(AttachClaim {
                connection: ConnectionHandle::new(ConnectionId::new(2), tx),
                prior_state: SessionState::Detached,
                started_at: Instant::now(),
                timer: None,
            });
        })
        .unwrap();

    let check = |registry: &SessionRegistry| {
        registry
            .with_session(&id, |session| eviction_reason(session, Instant::now(), budgets()))
            .unwrap()
    };

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(check(&registry), None);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(check(&registry), Some(TerminationReason::IdleExpired));
}

#[tokio::test(start_paused = true)]
async fn test_pending_and_closing_never_swept() {
    let registry = registry();
    let pending = SessionId::from("pending");
    let closing = SessionId::from("closing");
    registry.create(pending.clone()).unwrap();
    registry.create(closing.clone()).unwrap();
    registry
        .with_session(&closing, |session| session.state = SessionState::Closing)
        .unwrap();

    tokio::time::advance(Duration::from_secs(10_000)).await;
    assert!(registry.expired(Instant::now(), budgets()).is_empty());
}
