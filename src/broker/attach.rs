//! Attachment protocol for one client connection
//!
//! A [`ClientConnection`] walks a single WebSocket connection through the
//! protocol. It starts either `Pending` on a fresh placeholder session or
//! `Claiming` an existing session named in the connection URL. The first
//! credentials message then either authenticates the placeholder or
//! completes the reattachment. After that the connection is `Attached` and
//! carries input and resizes until it closes.
//!
//! Messages of one connection are handled sequentially (`&mut self`), but
//! every await (validator, spawner) is a point where timers, the sweeper or
//! other connections may have changed the session. Each step therefore
//! re-checks the session before acting.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bridge::SpawnRequest;
use crate::credentials::{CredentialHash, ValidationOutcome};
use crate::error::{CLOSE_NORMAL, TerminationReason};
use crate::session::{ConnectionHandle, Outbound, SessionState};
use crate::types::{
    ClientMessage, ConnectionId, Credentials, ServerMessage, SessionEvent, SessionEventKind,
    SessionId, TerminalSize,
};

use super::core::BrokerInner;
use super::lifecycle::ClaimOutcome;

/// What a client's disconnect means for its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectIntent {
    /// Terminate the session and its process
    EndSession,
    /// Keep the session for reattachment
    Detach,
}

impl DisconnectIntent {
    /// Intent carried by a client close code
    ///
    /// A normal closure (1000) ends the session; anything else, including a
    /// connection that dropped without a close frame, detaches.
    #[must_use]
    pub fn from_close_code(code: Option<u16>) -> Self {
        if code == Some(CLOSE_NORMAL) {
            Self::EndSession
        } else {
            Self::Detach
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Pending(SessionId),
    Claiming(SessionId),
    Attached(SessionId),
    Closed,
}

/// Broker side of one WebSocket connection
pub struct ClientConnection {
    broker: Arc<BrokerInner>,
    handle: ConnectionHandle,
    binding: Binding,
    size: Option<TerminalSize>,
}

impl ClientConnection {
    pub(crate) fn open(
        broker: Arc<BrokerInner>,
        outbound: mpsc::UnboundedSender<Outbound>,
        resume: Option<SessionId>,
    ) -> Self {
        let handle = ConnectionHandle::new(broker.next_connection_id(), outbound);
        let mut connection = Self {
            broker,
            handle,
            binding: Binding::Closed,
            size: None,
        };

        if let Some(session_id) = resume {
            match connection.broker.claim(&session_id, &connection.handle) {
                ClaimOutcome::Claimed => {
                    log::info!(
                        "[{session_id}] Reattachment claimed by {}",
                        connection.handle.id()
                    );
                    connection.binding = Binding::Claiming(session_id);
                    return connection;
                }
                ClaimOutcome::Refused(reason) => {
                    log::info!(
                        "[{session_id}] Reattachment by {} refused ({reason})",
                        connection.handle.id()
                    );
                    connection.handle.close(reason.close_frame());
                    return connection;
                }
                ClaimOutcome::Unknown => {
                    log::debug!("Unknown session {session_id} requested, starting a new one");
                }
            }
        }

        if let Some(session_id) = connection.broker.open_placeholder(&connection.handle) {
            connection.binding = Binding::Pending(session_id);
        }
        connection
    }

    /// Connection identity
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Session this connection is bound to, if any
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        match &self.binding {
            Binding::Pending(id) | Binding::Claiming(id) | Binding::Attached(id) => Some(id),
            Binding::Closed => None,
        }
    }

    /// Whether the connection is attached to a live session
    #[must_use]
    pub fn is_attached(&self) -> bool {
        matches!(self.binding, Binding::Attached(_))
    }

    /// Whether the broker is done with this connection
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.binding == Binding::Closed
    }

    /// Handle one decoded client message
    pub async fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Credentials {
                credentials,
                resume_session_id,
            } => self.on_credentials(credentials, resume_session_id).await,
            ClientMessage::Input(data) => self.on_input(data),
            ClientMessage::Resize(size) => self.on_resize(size),
        }
    }

    /// The client went away
    pub fn close(mut self, intent: DisconnectIntent) {
        self.disconnect(intent);
    }

    // ========================================================================
    // CREDENTIALS
    // ========================================================================

    async fn on_credentials(&mut self, credentials: Credentials, resume: Option<SessionId>) {
        match self.binding.clone() {
            Binding::Pending(placeholder) => {
                if let Some(target) = resume.filter(|target| *target != placeholder)
                    && self.broker.registry.contains(&target)
                {
                    self.switch_to_resume(placeholder, target, credentials)
                        .await;
                } else {
                    self.authenticate(placeholder, credentials).await;
                }
            }
            Binding::Claiming(session_id) => self.reattach(session_id, credentials).await,
            Binding::Attached(session_id) => {
                log::debug!("[{session_id}] Ignoring credentials on an attached connection");
            }
            Binding::Closed => {}
        }
    }

    /// First-time authentication of a placeholder session
    async fn authenticate(&mut self, session_id: SessionId, credentials: Credentials) {
        let connection_id = self.handle.id();
        let validator = Arc::clone(&self.broker.validator);
        let outcome = validator.validate(&credentials).await;

        if let ValidationOutcome::Rejected(reason) = outcome {
            log::info!("[{session_id}] Credentials rejected: {reason}");
            self.broker
                .terminate_if(&session_id, TerminationReason::AuthRejected, |session| {
                    session.state == SessionState::PendingAuth
                        && session.is_attached_to(connection_id)
                });
            self.binding = Binding::Closed;
            return;
        }

        let hash = CredentialHash::of(&credentials);
        let idle = self.broker.config.idle_timeout();
        let broker = Arc::clone(&self.broker);
        let handle = &self.handle;

        let accepted = broker
            .registry
            .with_session(&session_id, |session| {
                // The auth timer may have fired during validation
                if session.state != SessionState::PendingAuth
                    || !session.is_attached_to(connection_id)
                {
                    return false;
                }
                if session.credential_hash.is_none() {
                    session.credential_hash = Some(hash);
                }
                if let Some(timer) = session.auth_timer.take() {
                    broker.timers.cancel(timer);
                }
                session.state = SessionState::Active;
                session.touch();
                session.idle_timer = Some(broker.schedule_idle_timer(&session_id, idle));
                handle.send(ServerMessage::SessionId(session_id.clone()));
                true
            })
            .unwrap_or(false);

        if !accepted {
            self.binding = Binding::Closed;
            return;
        }

        log::info!("[{session_id}] Authenticated {connection_id} ({hash:?})");
        self.broker.registry.publish(SessionEvent::new(
            session_id.clone(),
            Some(connection_id),
            SessionEventKind::Authenticated,
        ));
        self.binding = Binding::Attached(session_id.clone());
        self.start_process(session_id, credentials).await;
    }

    async fn start_process(&mut self, session_id: SessionId, credentials: Credentials) {
        let size = self
            .size
            .unwrap_or_else(|| self.broker.config.default_size());
        let request = SpawnRequest {
            session_id: session_id.clone(),
            size,
            credentials,
        };

        let spawner = Arc::clone(&self.broker.spawner);
        match spawner.spawn(request).await {
            Ok(process) => self.broker.install_process(&session_id, process),
            Err(e) => {
                log::warn!("[{session_id}] {e}");
                self.broker
                    .terminate_if(&session_id, TerminationReason::SpawnFailed, |session| {
                        session.bridge.is_none()
                    });
                self.binding = Binding::Closed;
            }
        }
    }

    /// Credentials on a placeholder name a different, existing session
    async fn switch_to_resume(
        &mut self,
        placeholder: SessionId,
        target: SessionId,
        credentials: Credentials,
    ) {
        let connection_id = self.handle.id();
        match self.broker.claim(&target, &self.handle) {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Unknown => {
                // Gone since the lookup: treat as a fresh session
                self.authenticate(placeholder, credentials).await;
                return;
            }
            ClaimOutcome::Refused(reason) => {
                log::info!("[{target}] Reattachment by {connection_id} refused ({reason})");
                self.broker.terminate_if(&placeholder, reason, |session| {
                    session.is_attached_to(connection_id)
                });
                self.binding = Binding::Closed;
                return;
            }
        }

        // Take the connection out of the placeholder so deleting it does not close us
        let released = self
            .broker
            .registry
            .with_session(&placeholder, |session| {
                if session.state != SessionState::PendingAuth
                    || !session.is_attached_to(connection_id)
                {
                    return false;
                }
                session.connection = None;
                session.state = SessionState::Closing;
                true
            })
            .unwrap_or(false);

        if !released {
            // Auth timer already closed this connection
            self.broker.release_claim(&target, connection_id);
            self.binding = Binding::Closed;
            return;
        }

        self.broker
            .registry
            .delete(&placeholder, TerminationReason::Superseded);
        log::info!("[{target}] Reattachment claimed by {connection_id}");
        self.binding = Binding::Claiming(target.clone());
        self.reattach(target, credentials).await;
    }

    /// Complete a claimed reattachment
    async fn reattach(&mut self, session_id: SessionId, credentials: Credentials) {
        let connection_id = self.handle.id();
        let hash = CredentialHash::of(&credentials);

        match self.broker.claim_matches(&session_id, connection_id, &hash) {
            None => {
                log::debug!("[{session_id}] Claim by {connection_id} no longer held");
                self.binding = Binding::Closed;
                return;
            }
            Some(false) => {
                log::info!("[{session_id}] Reattachment by {connection_id}: credentials mismatch");
                self.refuse_claim(&session_id, TerminationReason::ResumeMismatch);
                return;
            }
            Some(true) => {}
        }

        let validator = Arc::clone(&self.broker.validator);
        if let ValidationOutcome::Rejected(reason) = validator.validate(&credentials).await {
            log::info!("[{session_id}] Reattachment by {connection_id} rejected: {reason}");
            self.refuse_claim(&session_id, TerminationReason::AuthRejected);
            return;
        }

        if self.broker.complete_claim(&session_id, &self.handle) {
            self.binding = Binding::Attached(session_id);
        } else {
            log::debug!("[{session_id}] Claim by {connection_id} lost during validation");
            self.binding = Binding::Closed;
        }
    }

    fn refuse_claim(&mut self, session_id: &SessionId, reason: TerminationReason) {
        if self.broker.release_claim(session_id, self.handle.id()) {
            self.handle.close(reason.close_frame());
        }
        self.binding = Binding::Closed;
    }

    // ========================================================================
    // TRAFFIC
    // ========================================================================

    fn on_input(&mut self, data: Vec<u8>) {
        let Binding::Attached(session_id) = &self.binding else {
            log::debug!("{} sent input before authenticating", self.handle.id());
            return;
        };
        let connection_id = self.handle.id();

        let routed = self
            .broker
            .registry
            .with_session(session_id, |session| {
                if !session.is_attached_to(connection_id) {
                    return false;
                }
                session.touch();
                if let Some(bridge) = &session.bridge
                    && !bridge.send_input(data)
                {
                    log::warn!("[{}] Process stdin closed, input dropped", session.id);
                }
                true
            })
            .unwrap_or(false);

        if !routed {
            // Replaced by another connection or terminated
            self.binding = Binding::Closed;
        }
    }

    fn on_resize(&mut self, size: TerminalSize) {
        self.size = Some(size);
        let Binding::Attached(session_id) = &self.binding else {
            return;
        };
        let connection_id = self.handle.id();

        self.broker.registry.with_session(session_id, |session| {
            if !session.is_attached_to(connection_id) {
                return;
            }
            if let Some(bridge) = session.bridge.as_mut()
                && let Err(e) = bridge.resize(size)
            {
                log::warn!("[{}] Resize failed: {e}", session.id);
            }
        });
    }

    // ========================================================================
    // DISCONNECT
    // ========================================================================

    fn disconnect(&mut self, intent: DisconnectIntent) {
        let connection_id = self.handle.id();
        match std::mem::replace(&mut self.binding, Binding::Closed) {
            Binding::Pending(session_id) => {
                self.broker
                    .terminate_if(&session_id, TerminationReason::ClientClosed, |session| {
                        session.state == SessionState::PendingAuth
                            && session.is_attached_to(connection_id)
                    });
            }
            Binding::Claiming(session_id) => {
                if self.broker.release_claim(&session_id, connection_id) {
                    log::info!("[{session_id}] Reattachment abandoned by {connection_id}");
                }
            }
            Binding::Attached(session_id) => match intent {
                DisconnectIntent::EndSession => {
                    self.broker
                        .terminate_if(&session_id, TerminationReason::ClientClosed, |session| {
                            session.is_attached_to(connection_id)
                        });
                }
                DisconnectIntent::Detach => {
                    self.broker.detach(&session_id, connection_id);
                }
            },
            Binding::Closed => {}
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.disconnect(DisconnectIntent::Detach);
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.handle.id())
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}
