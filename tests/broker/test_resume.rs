//! Tests for session reattachment
//!
//! Resume by URL and by credentials message, credential mismatch, claim
//! conflicts and claim timeouts.

#[path = "../common/mod.rs"]
mod common;

use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kodegen_terminal_broker::{
    Broker, BrokerConfig, DisconnectIntent, SessionEventKind, SessionId, SessionState,
    TimerKind, ValidationOutcome, ValidatorFn,
};

struct Fixture {
    broker: Broker,
    spawned: tokio::sync::mpsc::UnboundedReceiver<FakeProcess>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: BrokerConfig) -> Self {
        init_logging();
        let (spawner, spawned) = FakeSpawner::new();
        Self {
            broker: Broker::new(config, accept_all(), spawner),
            spawned,
        }
    }

    /// Authenticated session whose client has gone away
    async fn detached_session(&mut self) -> (SessionId, FakeProcess) {
        let mut client = TestClient::connect(&self.broker, None);
        client.send_credentials(API_KEY, None).await;
        let session_id = TestClient::announced_session(&client.drain()).unwrap();
        client.connection.close(DisconnectIntent::Detach);
        let process = self.spawned.try_recv().unwrap();
        (session_id, process)
    }
}

#[tokio::test(start_paused = true)]
async fn test_resume_by_url_replays_buffered_output() {
    let mut fx = Fixture::new();
    let mut events = fx.broker.subscribe();
    let (session_id, process) = fx.detached_session().await;

    process.emit(b"missed ");
    process.emit(b"output");
    settle().await;

    tokio::time::advance(Duration::from_secs(200)).await;

    let mut client = TestClient::connect(&fx.broker, Some(session_id.clone()));
    assert!(client.drain().is_empty());
    let claimed = fx.broker.snapshot(&session_id).unwrap();
    assert_eq!(claimed.state, SessionState::Attaching);
    assert!(claimed.is_attaching);
    assert_eq!(fx.broker.session_count(), 1);

    client.send_credentials(API_KEY, None).await;

    let frames = client.drain();
    assert_eq!(TestClient::announced_session(&frames), Some(session_id.clone()));
    assert_eq!(TestClient::output(&frames), b"missed output");
    assert!(TestClient::close_frame(&frames).is_none());

    let snapshot = fx.broker.snapshot(&session_id).unwrap();
    assert_eq!(snapshot.state, SessionState::Active);
    assert!(!snapshot.is_attaching);
    assert_eq!(snapshot.replay_bytes, 0);
    assert_eq!(snapshot.connection_id, Some(client.connection.id()));
    assert_eq!(fx.broker.timers().pending_kind(&session_id, TimerKind::Attach), 0);
    assert_eq!(fx.broker.timers().pending_kind(&session_id, TimerKind::Idle), 1);

    assert!(
        std::iter::from_fn(|| events.try_recv().ok())
            .any(|event| event.kind == SessionEventKind::Resumed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_resume_resets_idle_budget() {
    let mut fx = Fixture::new();
    let (session_id, _process) = fx.detached_session().await;

    tokio::time::advance(Duration::from_secs(200)).await;
    let mut client = TestClient::connect(&fx.broker, Some(session_id.clone()));
    client.send_credentials(API_KEY, None).await;
    client.drain();

    // 450s after creation, 250s after the resume
    tokio::time::advance(Duration::from_secs(250)).await;
    settle().await;
    assert!(fx.broker.snapshot(&session_id).is_some());
    assert!(client.drain().is_empty());

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    let close = TestClient::close_frame(&client.drain()).expect("idle close");
    assert_eq!(close.reason, "Session idle timeout");
}

#[tokio::test(start_paused = true)]
async fn test_resume_in_credentials_discards_placeholder() {
    let mut fx = Fixture::new();
    let (session_id, mut process) = fx.detached_session().await;

    let mut client = TestClient::connect(&fx.broker, None);
    let placeholder = client.connection.session_id().cloned().unwrap();
    assert_eq!(fx.broker.session_count(), 2);

    client
        .send_credentials(API_KEY, Some(session_id.clone()))
        .await;

    let frames = client.drain();
    assert_eq!(TestClient::announced_session(&frames), Some(session_id.clone()));
    assert!(TestClient::close_frame(&frames).is_none());
    assert!(fx.broker.snapshot(&placeholder).is_none());
    assert_eq!(fx.broker.session_count(), 1);
    assert_eq!(fx.broker.timers().pending_for(&placeholder), 0);
    assert!(fx.spawned.try_recv().is_err());

    client.send_input(b"pwd\n").await;
    assert_eq!(process.read_input(4).await, b"pwd\n");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_resume_id_starts_new_session() {
    let mut fx = Fixture::new();
    let unknown = SessionId::from("no-such-session");

    let mut by_url = TestClient::connect(&fx.broker, Some(unknown.clone()));
    let url_session = by_url.connection.session_id().cloned().unwrap();
    assert_ne!(url_session, unknown);
    by_url.send_credentials(API_KEY, None).await;
    assert_eq!(TestClient::announced_session(&by_url.drain()), Some(url_session));

    let mut by_message = TestClient::connect(&fx.broker, None);
    by_message
        .send_credentials(API_KEY, Some(unknown.clone()))
        .await;
    let announced = TestClient::announced_session(&by_message.drain()).unwrap();
    assert_ne!(announced, unknown);

    assert_eq!(fx.broker.session_count(), 2);
    assert!(fx.spawned.try_recv().is_ok());
    assert!(fx.spawned.try_recv().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_mismatched_credentials_rejected_session_kept() {
    let mut fx = Fixture::new();
    let (session_id, process) = fx.detached_session().await;
    process.emit(b"keep me");
    settle().await;

    let mut intruder = TestClient::connect(&fx.broker, Some(session_id.clone()));
    intruder.send_credentials(OTHER_API_KEY, None).await;

    let close = TestClient::close_frame(&intruder.drain()).expect("rejected");
    assert_eq!(close.code, 4001);
    assert_eq!(close.reason, "Session credentials mismatch");

    let snapshot = fx.broker.snapshot(&session_id).unwrap();
    assert_eq!(snapshot.state, SessionState::Detached);
    assert!(!snapshot.is_attaching);
    assert!(!snapshot.has_idle_timer);
    assert_eq!(snapshot.replay_bytes, 7);
    assert!(!process.is_killed());

    let mut owner = TestClient::connect(&fx.broker, Some(session_id.clone()));
    owner.send_credentials(API_KEY, None).await;
    let frames = owner.drain();
    assert_eq!(TestClient::announced_session(&frames), Some(session_id));
    assert_eq!(TestClient::output(&frames), b"keep me");
}

#[tokio::test(start_paused = true)]
async fn test_mismatch_via_credentials_message_removes_placeholder() {
    let mut fx = Fixture::new();
    let (session_id, _process) = fx.detached_session().await;

    let mut intruder = TestClient::connect(&fx.broker, None);
    intruder
        .send_credentials(OTHER_API_KEY, Some(session_id.clone()))
        .await;

    let close = TestClient::close_frame(&intruder.drain()).expect("rejected");
    assert_eq!(close.code, 4001);
    assert_eq!(fx.broker.session_count(), 1);
    assert_eq!(
        fx.broker.snapshot(&session_id).unwrap().state,
        SessionState::Detached
    );
}

#[tokio::test(start_paused = true)]
async fn test_revoked_credentials_rejected_on_resume() {
    init_logging();
    let revoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&revoked);
    let validator = Arc::new(ValidatorFn::new(move |_credentials| {
        let revoked = flag.load(Ordering::SeqCst);
        async move {
            if revoked {
                ValidationOutcome::rejected("revoked")
            } else {
                ValidationOutcome::Accepted
            }
        }
    }));
    let (spawner, mut spawned) = FakeSpawner::new();
    let broker = Broker::new(test_config(), validator, spawner);

    let mut client = TestClient::connect(&broker, None);
    client.send_credentials(API_KEY, None).await;
    let session_id = TestClient::announced_session(&client.drain()).unwrap();
    client.connection.close(DisconnectIntent::Detach);
    let _process = spawned.try_recv().unwrap();

    revoked.store(true, Ordering::SeqCst);
    let mut returning = TestClient::connect(&broker, Some(session_id.clone()));
    returning.send_credentials(API_KEY, None).await;

    let close = TestClient::close_frame(&returning.drain()).expect("rejected");
    assert_eq!(close.code, 4001);
    assert_eq!(close.reason, "Invalid token");
    assert_eq!(
        broker.snapshot(&session_id).unwrap().state,
        SessionState::Detached
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_claim_rejected_while_attaching() {
    let mut fx = Fixture::new();
    let (session_id, _process) = fx.detached_session().await;

    let mut first = TestClient::connect(&fx.broker, Some(session_id.clone()));
    let mut second = TestClient::connect(&fx.broker, Some(session_id.clone()));

    let close = TestClient::close_frame(&second.drain()).expect("rejected");
    assert_eq!(close.code, 4001);
    assert_eq!(close.reason, "Session resume already in progress");
    assert!(second.connection.is_closed());

    // The losing attempt left the claim alone
    let snapshot = fx.broker.snapshot(&session_id).unwrap();
    assert_eq!(snapshot.state, SessionState::Attaching);
    assert_eq!(fx.broker.session_count(), 1);

    first.send_credentials(API_KEY, None).await;
    assert_eq!(
        TestClient::announced_session(&first.drain()),
        Some(session_id.clone())
    );
    assert_eq!(
        fx.broker.snapshot(&session_id).unwrap().connection_id,
        Some(first.connection.id())
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_resumes_at_most_one_wins() {
    init_logging();
    let (spawner, mut spawned) = FakeSpawner::new();
    let broker = Broker::new(
        test_config(),
        slow_accept(Duration::from_millis(500)),
        spawner,
    );

    let mut owner = TestClient::connect(&broker, None);
    owner.send_credentials(API_KEY, None).await;
    let session_id = TestClient::announced_session(&owner.drain()).unwrap();
    owner.connection.close(DisconnectIntent::Detach);
    let _process = spawned.try_recv().unwrap();

    let mut a = TestClient::connect(&broker, None);
    let mut b = TestClient::connect(&broker, None);
    tokio::join!(
        a.send_credentials(API_KEY, Some(session_id.clone())),
        b.send_credentials(API_KEY, Some(session_id.clone())),
    );

    let frames_a = a.drain();
    let frames_b = b.drain();
    let winners = [&frames_a, &frames_b]
        .iter()
        .filter(|frames| TestClient::announced_session(frames) == Some(session_id.clone()))
        .count();
    let losers: Vec<_> = [&frames_a, &frames_b]
        .iter()
        .filter_map(|frames| TestClient::close_frame(frames))
        .collect();

    assert_eq!(winners, 1);
    assert_eq!(losers.len(), 1);
    assert_eq!(losers[0].code, 4001);

    let snapshot = broker.snapshot(&session_id).unwrap();
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_claim_timeout_leaves_session_detached() {
    let mut fx = Fixture::new();
    let (session_id, _process) = fx.detached_session().await;

    let mut silent = TestClient::connect(&fx.broker, Some(session_id.clone()));
    tokio::time::advance(Duration::from_secs(11)).await;
    settle().await;

    let close = TestClient::close_frame(&silent.drain()).expect("timed out");
    assert_eq!(close.code, 4001);
    assert_eq!(close.reason, "Authentication timeout");

    let snapshot = fx.broker.snapshot(&session_id).unwrap();
    assert_eq!(snapshot.state, SessionState::Detached);
    assert!(!snapshot.is_attaching);
    assert!(!snapshot.has_idle_timer);
    assert_eq!(fx.broker.timers().pending_for(&session_id), 0);

    // Credentials after the claim expired change nothing
    silent.send_credentials(API_KEY, None).await;
    assert!(silent.drain().is_empty());

    let mut retry = TestClient::connect(&fx.broker, Some(session_id.clone()));
    retry.send_credentials(API_KEY, None).await;
    assert_eq!(TestClient::announced_session(&retry.drain()), Some(session_id));
}

#[tokio::test(start_paused = true)]
async fn test_resume_replaces_active_connection() {
    let mut fx = Fixture::new();
    let mut old = TestClient::connect(&fx.broker, None);
    old.send_credentials(API_KEY, None).await;
    let session_id = TestClient::announced_session(&old.drain()).unwrap();
    let mut process = fx.spawned.try_recv().unwrap();

    let mut new = TestClient::connect(&fx.broker, Some(session_id.clone()));

    // Old connection keeps its output while the claim is pending
    process.emit(b"one");
    settle().await;
    assert_eq!(TestClient::output(&old.drain()), b"one");

    new.send_credentials(API_KEY, None).await;
    let close = TestClient::close_frame(&old.drain()).expect("replaced");
    assert_eq!(close.code, 1000);
    assert_eq!(close.reason, "Session resumed elsewhere");
    assert_eq!(
        TestClient::announced_session(&new.drain()),
        Some(session_id.clone())
    );

    process.emit(b"two");
    settle().await;
    assert_eq!(TestClient::output(&new.drain()), b"two");

    // The replaced connection can no longer drive the process
    old.send_input(b"rm -rf\n").await;
    assert!(old.connection.is_closed());
    new.send_input(b"ok\n").await;
    assert_eq!(process.read_input(3).await, b"ok\n");

    old.connection.close(DisconnectIntent::Detach);
    assert_eq!(
        fx.broker.snapshot(&session_id).unwrap().state,
        SessionState::Active
    );
}

#[tokio::test(start_paused = true)]
async fn test_original_disconnect_during_claim_then_claim_expires() {
    let mut fx = Fixture::new();
    let mut old = TestClient::connect(&fx.broker, None);
    old.send_credentials(API_KEY, None).await;
    let session_id = TestClient::announced_session(&old.drain()).unwrap();
    let _process = fx.spawned.try_recv().unwrap();

    let _claimer = TestClient::connect(&fx.broker, Some(session_id.clone()));
    old.connection.close(DisconnectIntent::Detach);

    let during = fx.broker.snapshot(&session_id).unwrap();
    assert_eq!(during.state, SessionState::Attaching);
    assert!(during.connection_id.is_none());

    tokio::time::advance(Duration::from_secs(11)).await;
    settle().await;

    let after = fx.broker.snapshot(&session_id).unwrap();
    assert_eq!(after.state, SessionState::Detached);
    assert!(!after.has_idle_timer);
}

#[tokio::test(start_paused = true)]
async fn test_pending_session_cannot_be_claimed() {
    let fx = Fixture::new();
    let mut pending = TestClient::connect(&fx.broker, None);
    let pending_id = pending.connection.session_id().cloned().unwrap();

    let mut hijack = TestClient::connect(&fx.broker, Some(pending_id.clone()));
    let close = TestClient::close_frame(&hijack.drain()).expect("refused");
    assert_eq!(close.code, 4001);

    assert_eq!(
        fx.broker.snapshot(&pending_id).unwrap().state,
        SessionState::PendingAuth
    );
    assert!(pending.drain().is_empty());
}
