//! Per-session timeout scheduling
//!
//! Every auth, idle and attach timeout goes through [`TimerManager`]. A timer
//! is "pending" from `schedule` until it either fires or is cancelled, and
//! exactly one of those wins: the firing task removes its entry from the
//! pending set under the lock and only runs the callback if the entry was
//! still there, while `cancel` removes the entry and aborts the task. A
//! cancelled timer therefore never runs its callback, even if its sleep had
//! already elapsed.
//!
//! Callbacks must still re-check the session they refer to. Between the
//! pending-set removal and the callback body a racing deletion may have
//! already torn the session down.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::types::SessionId;

/// What a timer guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Credentials budget of a new connection
    Auth,
    /// Idle budget of an active or attaching session
    Idle,
    /// Credentials budget of a reattachment claim
    Attach,
}

/// Unique timer identity, compared by callbacks against the session's stored handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct PendingTimer {
    session_id: SessionId,
    kind: TimerKind,
}

#[derive(Debug, Default)]
struct TimerState {
    pending: Mutex<HashMap<TimerId, PendingTimer>>,
    next_id: AtomicU64,
}

/// Scheduler for session timeouts
#[derive(Debug, Clone, Default)]
pub struct TimerManager {
    state: Arc<TimerState>,
}

impl TimerManager {
    /// Create an empty timer manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_fire` to run once after `after`, unless cancelled first
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(
        &self,
        session_id: &SessionId,
        kind: TimerKind,
        after: Duration,
        on_fire: F,
    ) -> TimerHandle
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let id = TimerId(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.pending.lock().insert(
            id,
            PendingTimer {
                session_id: session_id.clone(),
                kind,
            },
        );

        // Deadline is fixed at scheduling time, not at first poll
        let deadline = Instant::now() + after;
        let state = Arc::downgrade(&self.state);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let armed = state
                .upgrade()
                .is_some_and(|state| state.pending.lock().remove(&id).is_some());
            if armed {
                on_fire(id);
            }
        });

        log::trace!("Scheduled {kind:?} timer {id:?} for session {session_id} in {after:?}");

        TimerHandle {
            id,
            kind,
            task: Some(task),
            state: Arc::downgrade(&self.state),
        }
    }

    /// Cancel a timer; its callback will not run
    pub fn cancel(&self, mut handle: TimerHandle) {
        handle.disarm();
    }

    /// Number of timers still pending for a session
    #[must_use]
    pub fn pending_for(&self, session_id: &SessionId) -> usize {
        self.state
            .pending
            .lock()
            .values()
            .filter(|timer| &timer.session_id == session_id)
            .count()
    }

    /// Pending timers of a given kind for a session
    #[must_use]
    pub fn pending_kind(&self, session_id: &SessionId, kind: TimerKind) -> usize {
        self.state
            .pending
            .lock()
            .values()
            .filter(|timer| &timer.session_id == session_id && timer.kind == kind)
            .count()
    }

    /// Number of timers pending across all sessions
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.pending.lock().len()
    }
}

/// Owned handle to a scheduled timer
///
/// Dropping the handle also disarms the timer, but owners cancel explicitly
/// through [`TimerManager::cancel`] whenever they replace or clear it.
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    kind: TimerKind,
    task: Option<JoinHandle<()>>,
    state: Weak<TimerState>,
}

impl TimerHandle {
    /// Timer identity
    #[must_use]
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Timer kind
    #[must_use]
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    fn disarm(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(state) = self.state.upgrade() {
            state.pending.lock().remove(&self.id);
        }
        task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.disarm();
    }
}
