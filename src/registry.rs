//! Session registry
//!
//! The single mutable structure shared between connections, timers, process
//! pumps and the sweeper. All access goes through short synchronous sections
//! under one `parking_lot` mutex; nothing holds the lock across an `.await`.
//! Deletion is the only way a session leaves the registry and always releases
//! its timers, connection and process together.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{BrokerError, Result, TerminationReason};
use crate::session::{Session, SessionSnapshot, SessionState};
use crate::timers::TimerManager;
use crate::types::{SessionEvent, SessionEventKind, SessionId};

/// Lifecycle event channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Eviction budgets applied by [`SessionRegistry::expired`]
#[derive(Debug, Clone, Copy)]
pub struct EvictionBudgets {
    /// Maximum time without traffic
    pub idle: Duration,
    /// Maximum time since creation
    pub lifetime: Duration,
    /// Idle eviction is deferred this long after a reattachment claim
    pub attach_grace: Duration,
}

/// Registry of live sessions keyed by session id
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
    timers: TimerManager,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    /// Create an empty registry cancelling timers through `timers`
    #[must_use]
    pub fn new(timers: TimerManager) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            timers,
            events,
        }
    }

    /// Timer manager shared with the broker
    #[must_use]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register a new session in `PendingAuth`
    ///
    /// # Errors
    /// Returns `SessionExists` if the id is already registered. Ids are
    /// random, so this indicates a caller bug.
    pub fn create(&self, id: SessionId) -> Result<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(BrokerError::session_exists(id.as_str()));
        }
        let session = Session::new(id.clone());
        let snapshot = session.snapshot();
        sessions.insert(id, session);
        Ok(snapshot)
    }

    /// Register a new session unless `limit` sessions already exist
    ///
    /// # Errors
    /// Returns `MaxSessionsReached` at capacity, `SessionExists` on collision
    pub fn create_bounded(&self, id: SessionId, limit: usize) -> Result<SessionSnapshot> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= limit {
            return Err(BrokerError::max_sessions_reached(limit));
        }
        if sessions.contains_key(&id) {
            return Err(BrokerError::session_exists(id.as_str()));
        }
        let session = Session::new(id.clone());
        let snapshot = session.snapshot();
        sessions.insert(id, session);
        Ok(snapshot)
    }

    /// Snapshot of a session, if registered
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.lock().get(id).map(Session::snapshot)
    }

    /// Whether a session is registered
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Run a short synchronous mutation on a session
    ///
    /// `f` runs with the registry locked: it must not call back into the
    /// registry or block.
    pub fn with_session<R>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.lock().get_mut(id).map(f)
    }

    /// Remove a session and release everything it owns
    ///
    /// Cancels the auth, idle and claim timers, closes the attached (and any
    /// claiming) connection with `reason`'s close frame, and kills the process.
    /// Idempotent: returns false if the session was already gone. Timer
    /// callbacks racing with this call find the session absent and do nothing.
    pub fn delete(&self, id: &SessionId, reason: TerminationReason) -> bool {
        let Some(mut session) = self.sessions.lock().remove(id) else {
            return false;
        };
        session.state = SessionState::Closing;

        if let Some(timer) = session.auth_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(timer) = session.idle_timer.take() {
            self.timers.cancel(timer);
        }

        let frame = reason.close_frame();
        if let Some(mut claim) = session.attaching.take() {
            if let Some(timer) = claim.timer.take() {
                self.timers.cancel(timer);
            }
            claim.connection.close(frame.clone());
        }

        let connection_id = session.connection.as_ref().map(|conn| conn.id());
        if let Some(connection) = session.connection.take() {
            connection.close(frame);
        }
        if let Some(bridge) = session.bridge.take() {
            bridge.kill();
        }
        session.state = SessionState::Terminated;

        log::info!("[{id}] Session terminated ({reason})");
        self.publish(SessionEvent::new(
            id.clone(),
            connection_id,
            SessionEventKind::Terminated(reason),
        ));
        true
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Registered session ids
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Sessions whose idle or lifetime budget has run out at `now`
    ///
    /// See [`eviction_reason`].
    #[must_use]
    pub fn expired(
        &self,
        now: Instant,
        budgets: EvictionBudgets,
    ) -> Vec<(SessionId, TerminationReason)> {
        let sessions = self.sessions.lock();
        sessions
            .values()
            .filter_map(|session| {
                eviction_reason(session, now, budgets).map(|reason| (session.id.clone(), reason))
            })
            .collect()
    }
}

/// Why the sweeper should evict `session` at `now`, if at all
///
/// `PendingAuth` sessions are bounded by their auth timer and never evicted
/// here, nor are sessions already being torn down.
#[must_use]
pub fn eviction_reason(
    session: &Session,
    now: Instant,
    budgets: EvictionBudgets,
) -> Option<TerminationReason> {
    if matches!(
        session.state,
        SessionState::PendingAuth | SessionState::Closing | SessionState::Terminated
    ) {
        return None;
    }
    if now.saturating_duration_since(session.created_at) >= budgets.lifetime {
        return Some(TerminationReason::LifetimeExpired);
    }
    if let Some(claim) = &session.attaching
        && now.saturating_duration_since(claim.started_at) < budgets.attach_grace
    {
        return None;
    }
    (now.saturating_duration_since(session.last_activity) >= budgets.idle)
        .then_some(TerminationReason::IdleExpired)
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}
