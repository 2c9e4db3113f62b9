//! Session state transitions driven by timers, claims and the process
//!
//! Every transition here runs as one short section under the registry lock,
//! so the invariants hold between sections: an idle timer exists exactly
//! while a session is `Active` or `Attaching`, an auth timer exactly while it
//! is `PendingAuth`, and at most one claim is in flight per session. Timer
//! callbacks compare their [`TimerId`] against the handle the session holds
//! and do nothing when it has been replaced.

use std::sync::Arc;
use tokio::time::Instant;

use crate::bridge::{OutputSink, ProcessBridge, ProcessExit, SpawnedProcess};
use crate::credentials::CredentialHash;
use crate::error::{BrokerError, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CloseFrame, TerminationReason};
use crate::session::{AttachClaim, ConnectionHandle, Session, SessionState};
use crate::timers::{TimerHandle, TimerId, TimerKind};
use crate::types::{ConnectionId, ServerMessage, SessionEvent, SessionEventKind, SessionId};

use super::core::BrokerInner;

/// Result of trying to claim a session for reattachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClaimOutcome {
    /// Claim taken, session is now `Attaching`
    Claimed,
    /// No such session
    Unknown,
    /// Session exists but cannot be claimed
    Refused(TerminationReason),
}

enum IdleVerdict {
    Stale,
    Expired,
    Rearmed,
}

// ============================================================================
// PLACEHOLDERS AND TERMINATION
// ============================================================================

impl BrokerInner {
    /// Allocate a `PendingAuth` session for a new connection
    ///
    /// Returns `None` after closing the connection when the registry is full.
    pub(crate) fn open_placeholder(
        self: &Arc<Self>,
        connection: &ConnectionHandle,
    ) -> Option<SessionId> {
        let session_id = SessionId::generate();
        if let Err(e) = self
            .registry
            .create_bounded(session_id.clone(), self.config.max_sessions)
        {
            if let BrokerError::MaxSessionsReached(max) = e {
                log::warn!("Refusing {}: {max} sessions already open", connection.id());
                connection.close(TerminationReason::CapacityReached.close_frame());
            } else {
                log::error!("Failed to allocate session for {}: {e}", connection.id());
                connection.close(CloseFrame::new(
                    CLOSE_INTERNAL_ERROR,
                    "Failed to allocate session",
                ));
            }
            return None;
        }

        let timer = self.schedule_auth_timer(&session_id);
        self.registry.with_session(&session_id, |session| {
            session.connection = Some(connection.clone());
            session.auth_timer = Some(timer);
        });

        log::debug!("[{session_id}] Awaiting credentials from {}", connection.id());
        self.registry.publish(SessionEvent::new(
            session_id.clone(),
            Some(connection.id()),
            SessionEventKind::Created,
        ));
        Some(session_id)
    }

    /// Delete a session if `predicate` holds at the moment of the check
    ///
    /// The session is marked `Closing` under the same lock as the check, so
    /// no other transition can slip in before the deletion.
    pub(crate) fn terminate_if(
        &self,
        session_id: &SessionId,
        reason: TerminationReason,
        predicate: impl FnOnce(&Session) -> bool,
    ) -> bool {
        let marked = self
            .registry
            .with_session(session_id, |session| {
                let live = !matches!(
                    session.state,
                    SessionState::Closing | SessionState::Terminated
                );
                if live && predicate(session) {
                    session.state = SessionState::Closing;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        marked && self.registry.delete(session_id, reason)
    }

    /// Attach a freshly spawned process to its session
    ///
    /// Kills the process instead when the session ended during the spawn.
    pub(crate) fn install_process(self: &Arc<Self>, session_id: &SessionId, process: SpawnedProcess) {
        let sink: Arc<dyn OutputSink> = Arc::clone(self) as Arc<dyn OutputSink>;
        let sink = Arc::downgrade(&sink);
        let capacity = self.config.replay_buffer_bytes;
        let mut process = Some(process);

        let installed = self
            .registry
            .with_session(session_id, |session| {
                let live = matches!(
                    session.state,
                    SessionState::Active | SessionState::Attaching | SessionState::Detached
                );
                if !live || session.bridge.is_some() {
                    return false;
                }
                if let Some(process) = process.take() {
                    session.bridge = Some(ProcessBridge::start(
                        session_id.clone(),
                        process,
                        sink,
                        capacity,
                    ));
                }
                true
            })
            .unwrap_or(false);

        if installed {
            log::debug!("[{session_id}] Process bridge started");
        } else if let Some(mut process) = process.take() {
            log::debug!("[{session_id}] Session ended before its process started");
            process.control.kill();
        }
    }
}

// ============================================================================
// TIMERS
// ============================================================================

impl BrokerInner {
    fn schedule_auth_timer(self: &Arc<Self>, session_id: &SessionId) -> TimerHandle {
        let broker = Arc::downgrade(self);
        let id = session_id.clone();
        self.timers.schedule(
            session_id,
            TimerKind::Auth,
            self.config.auth_timeout(),
            move |timer_id| {
                if let Some(broker) = broker.upgrade() {
                    broker.auth_timed_out(&id, timer_id);
                }
            },
        )
    }

    fn auth_timed_out(&self, session_id: &SessionId, timer_id: TimerId) {
        let expired = self.terminate_if(session_id, TerminationReason::AuthTimeout, |session| {
            session.state == SessionState::PendingAuth
                && session
                    .auth_timer
                    .as_ref()
                    .is_some_and(|timer| timer.id() == timer_id)
        });
        if expired {
            log::info!(
                "[{session_id}] No credentials within {:?}",
                self.config.auth_timeout()
            );
        }
    }

    /// Schedule the idle check for a session
    pub(crate) fn schedule_idle_timer(
        self: &Arc<Self>,
        session_id: &SessionId,
        after: std::time::Duration,
    ) -> TimerHandle {
        let broker = Arc::downgrade(self);
        let id = session_id.clone();
        self.timers
            .schedule(session_id, TimerKind::Idle, after, move |timer_id| {
                if let Some(broker) = broker.upgrade() {
                    broker.idle_timed_out(&id, timer_id);
                }
            })
    }

    fn idle_timed_out(self: &Arc<Self>, session_id: &SessionId, timer_id: TimerId) {
        let now = Instant::now();
        let idle = self.config.idle_timeout();
        let grace = self.config.attach_grace();

        let verdict = self
            .registry
            .with_session(session_id, |session| {
                let current = session
                    .idle_timer
                    .as_ref()
                    .is_some_and(|timer| timer.id() == timer_id);
                if !current || !session.state.has_idle_timer() {
                    return IdleVerdict::Stale;
                }

                let quiet = now.saturating_duration_since(session.last_activity);
                let mut remaining = idle.saturating_sub(quiet);
                if let Some(claim) = &session.attaching {
                    let claim_age = now.saturating_duration_since(claim.started_at);
                    remaining = remaining.max(grace.saturating_sub(claim_age));
                }

                if remaining.is_zero() {
                    session.state = SessionState::Closing;
                    IdleVerdict::Expired
                } else {
                    // Traffic since scheduling: check again when the budget runs out
                    session.idle_timer = Some(self.schedule_idle_timer(session_id, remaining));
                    IdleVerdict::Rearmed
                }
            })
            .unwrap_or(IdleVerdict::Stale);

        match verdict {
            IdleVerdict::Expired => {
                log::info!("[{session_id}] Idle for {idle:?}");
                self.registry
                    .delete(session_id, TerminationReason::IdleExpired);
            }
            IdleVerdict::Rearmed | IdleVerdict::Stale => {}
        }
    }

    fn schedule_attach_timer(
        self: &Arc<Self>,
        session_id: &SessionId,
        connection_id: ConnectionId,
    ) -> TimerHandle {
        let broker = Arc::downgrade(self);
        let id = session_id.clone();
        self.timers.schedule(
            session_id,
            TimerKind::Attach,
            self.config.auth_timeout(),
            move |timer_id| {
                if let Some(broker) = broker.upgrade() {
                    broker.attach_timed_out(&id, connection_id, timer_id);
                }
            },
        )
    }

    fn attach_timed_out(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        timer_id: TimerId,
    ) {
        let claimer = self
            .registry
            .with_session(session_id, |session| {
                let current = session.attaching.as_ref().is_some_and(|claim| {
                    claim.connection.id() == connection_id
                        && claim.timer.as_ref().is_some_and(|timer| timer.id() == timer_id)
                });
                if !current {
                    return None;
                }
                let claim = session.attaching.take()?;
                let connection = claim.connection.clone();
                self.restore_claim(session, claim);
                Some(connection)
            })
            .flatten();

        if let Some(connection) = claimer {
            log::info!("[{session_id}] Reattachment by {connection_id} timed out");
            connection.close(TerminationReason::AuthTimeout.close_frame());
        }
    }
}

// ============================================================================
// REATTACHMENT CLAIMS
// ============================================================================

impl BrokerInner {
    /// Claim a session for reattachment by `connection`
    ///
    /// Only `Active` or `Detached` sessions with a credential hash and no
    /// claim in flight can be claimed. A refused claim leaves the session
    /// untouched.
    pub(crate) fn claim(
        self: &Arc<Self>,
        session_id: &SessionId,
        connection: &ConnectionHandle,
    ) -> ClaimOutcome {
        let now = Instant::now();
        let idle = self.config.idle_timeout();
        let grace = self.config.attach_grace();

        self.registry
            .with_session(session_id, |session| {
                if session.is_attaching() {
                    return ClaimOutcome::Refused(TerminationReason::ResumeConflict);
                }
                if !session.state.is_resumable() || session.credential_hash.is_none() {
                    return ClaimOutcome::Refused(TerminationReason::ResumeMismatch);
                }

                if session.idle_timer.is_none() {
                    let quiet = now.saturating_duration_since(session.last_activity);
                    let after = idle.saturating_sub(quiet).max(grace);
                    session.idle_timer = Some(self.schedule_idle_timer(session_id, after));
                }

                session.attaching = Some(AttachClaim {
                    connection: connection.clone(),
                    prior_state: session.state,
                    started_at: now,
                    timer: Some(self.schedule_attach_timer(session_id, connection.id())),
                });
                session.state = SessionState::Attaching;
                ClaimOutcome::Claimed
            })
            .unwrap_or(ClaimOutcome::Unknown)
    }

    /// Whether `hash` matches the session `connection_id` holds a claim on
    ///
    /// `None` when the claim is gone (timed out or session deleted).
    pub(crate) fn claim_matches(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        hash: &CredentialHash,
    ) -> Option<bool> {
        self.registry
            .with_session(session_id, |session| {
                session
                    .is_claimed_by(connection_id)
                    .then(|| session.credential_hash.as_ref() == Some(hash))
            })
            .flatten()
    }

    /// Abandon a claim, restoring the session's prior state
    pub(crate) fn release_claim(&self, session_id: &SessionId, connection_id: ConnectionId) -> bool {
        self.registry
            .with_session(session_id, |session| {
                if !session.is_claimed_by(connection_id) {
                    return false;
                }
                match session.attaching.take() {
                    Some(claim) => {
                        self.restore_claim(session, claim);
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false)
    }

    fn restore_claim(&self, session: &mut Session, mut claim: AttachClaim) {
        if let Some(timer) = claim.timer.take() {
            self.timers.cancel(timer);
        }
        session.state = claim.prior_state;
        if !session.state.has_idle_timer()
            && let Some(timer) = session.idle_timer.take()
        {
            self.timers.cancel(timer);
        }
    }

    /// Finish a claim: attach `connection`, reset the idle budget and replay
    /// buffered output
    ///
    /// A previously attached connection is closed with 1000.
    pub(crate) fn complete_claim(
        self: &Arc<Self>,
        session_id: &SessionId,
        connection: &ConnectionHandle,
    ) -> bool {
        let idle = self.config.idle_timeout();
        let mut replaced = None;

        let completed = self
            .registry
            .with_session(session_id, |session| {
                if !session.is_claimed_by(connection.id()) {
                    return false;
                }
                let Some(mut claim) = session.attaching.take() else {
                    return false;
                };
                if let Some(timer) = claim.timer.take() {
                    self.timers.cancel(timer);
                }

                if let Some(previous) = session.connection.replace(connection.clone())
                    && previous.id() != connection.id()
                {
                    previous.close(CloseFrame::new(CLOSE_NORMAL, "Session resumed elsewhere"));
                    replaced = Some(previous.id());
                }

                session.state = SessionState::Active;
                session.touch();
                if let Some(timer) = session.idle_timer.take() {
                    self.timers.cancel(timer);
                }
                session.idle_timer = Some(self.schedule_idle_timer(session_id, idle));

                connection.send(ServerMessage::SessionId(session_id.clone()));
                if let Some(bridge) = session.bridge.as_mut() {
                    let replay = bridge.take_replay();
                    if !replay.is_empty() {
                        log::debug!("[{session_id}] Replaying {} buffered bytes", replay.len());
                        connection.send(ServerMessage::Output(replay));
                    }
                }
                true
            })
            .unwrap_or(false);

        if completed {
            if let Some(previous) = replaced {
                log::info!("[{session_id}] Resumed by {}, replacing {previous}", connection.id());
            } else {
                log::info!("[{session_id}] Resumed by {}", connection.id());
            }
            self.registry.publish(SessionEvent::new(
                session_id.clone(),
                Some(connection.id()),
                SessionEventKind::Resumed,
            ));
        }
        completed
    }

    /// Drop the attached connection without ending the session
    pub(crate) fn detach(&self, session_id: &SessionId, connection_id: ConnectionId) -> bool {
        let detached = self
            .registry
            .with_session(session_id, |session| {
                if !session.is_attached_to(connection_id) {
                    return false;
                }
                session.connection = None;
                if let Some(claim) = session.attaching.as_mut() {
                    // The claim decides the next state; a failed one now lands in Detached
                    claim.prior_state = SessionState::Detached;
                } else {
                    session.state = SessionState::Detached;
                    if let Some(timer) = session.idle_timer.take() {
                        self.timers.cancel(timer);
                    }
                }
                true
            })
            .unwrap_or(false);

        if detached {
            log::info!("[{session_id}] Detached from {connection_id}");
            self.registry.publish(SessionEvent::new(
                session_id.clone(),
                Some(connection_id),
                SessionEventKind::Detached,
            ));
        }
        detached
    }
}

// ============================================================================
// PROCESS OUTPUT
// ============================================================================

impl OutputSink for BrokerInner {
    fn on_output(&self, session_id: &SessionId, chunk: Vec<u8>) {
        self.registry.with_session(session_id, |session| {
            session.touch();
            let undelivered = match (&session.connection, session.state) {
                (Some(connection), SessionState::Active | SessionState::Attaching) => {
                    connection.send_output(chunk)
                }
                _ => Some(chunk),
            };
            if let Some(chunk) = undelivered
                && let Some(bridge) = session.bridge.as_mut()
            {
                bridge.buffer_output(&chunk);
            }
        });
    }

    fn on_exit(&self, session_id: &SessionId, exit: ProcessExit) {
        log::debug!("[{session_id}] Process exited (code {:?})", exit.code);
        self.terminate_if(
            session_id,
            TerminationReason::ProcessExited { code: exit.code },
            |_| true,
        );
    }
}
