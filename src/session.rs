//! Session state structures
//!
//! A [`Session`] is one logical terminal. It outlives individual WebSocket
//! connections: the connection slot is empty while the session is detached,
//! and the process bridge stays alive until the session is terminated.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bridge::ProcessBridge;
use crate::credentials::CredentialHash;
use crate::error::CloseFrame;
use crate::timers::TimerHandle;
use crate::types::{ConnectionId, ServerMessage, SessionId};

/// Session lifecycle states
///
/// `PendingAuth -> Active -> (Detached | Attaching) -> Active ... -> Terminated`.
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the first credentials message
    PendingAuth,
    /// A reattachment claim is in flight
    Attaching,
    /// Authenticated with a connection attached
    Active,
    /// Authenticated, no connection, resumable
    Detached,
    /// Teardown in progress
    Closing,
    /// Removed from the registry
    Terminated,
}

impl SessionState {
    /// States whose idle budget is tracked by an idle timer
    #[must_use]
    pub fn has_idle_timer(self) -> bool {
        matches!(self, Self::Active | Self::Attaching)
    }

    /// States a new connection may resume
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Active | Self::Detached)
    }
}

/// Frame queued for a connection's socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Protocol message
    Message(ServerMessage),
    /// Close the socket; nothing is sent after this
    Close(CloseFrame),
}

/// Sending half of a connection, owned by the session it is attached to
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Wrap a connection's outbound channel
    #[must_use]
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// Connection identity
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message; false once the socket writer is gone
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    /// Queue process output, handing the chunk back if the writer is gone
    pub fn send_output(&self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        match self.tx.send(Outbound::Message(ServerMessage::Output(chunk))) {
            Ok(()) => None,
            Err(mpsc::error::SendError(Outbound::Message(ServerMessage::Output(chunk)))) => {
                Some(chunk)
            }
            Err(_) => None,
        }
    }

    /// Queue a close frame
    pub fn close(&self, frame: CloseFrame) {
        let _ = self.tx.send(Outbound::Close(frame));
    }
}

/// A pending reattachment claim (the placeholder window)
#[derive(Debug)]
pub struct AttachClaim {
    /// Connection holding the claim
    pub connection: ConnectionHandle,
    /// State to restore if the claim fails
    pub prior_state: SessionState,
    /// When the claim was taken
    pub started_at: Instant,
    /// Credentials budget for the claim
    pub timer: Option<TimerHandle>,
}

/// Registry entry for one terminal session
#[derive(Debug)]
pub struct Session {
    /// Stable identifier
    pub id: SessionId,
    /// Fingerprint of the creating credentials; set once on first auth
    pub credential_hash: Option<CredentialHash>,
    /// Lifecycle state
    pub state: SessionState,
    /// Attached connection
    pub connection: Option<ConnectionHandle>,
    /// Interactive process
    pub bridge: Option<ProcessBridge>,
    /// Pending auth timeout (exactly while `PendingAuth`)
    pub auth_timer: Option<TimerHandle>,
    /// Pending idle timeout (exactly while `Active`/`Attaching`)
    pub idle_timer: Option<TimerHandle>,
    /// Reattachment claim (`isAttaching`)
    pub attaching: Option<AttachClaim>,
    /// Monotonic creation time
    pub created_at: Instant,
    /// Monotonic time of the last input/output
    pub last_activity: Instant,
    /// Wall-clock creation time, for operators
    pub created_wall: DateTime<Utc>,
}

impl Session {
    /// New placeholder session in `PendingAuth`
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        let now = Instant::now();
        Self {
            id,
            credential_hash: None,
            state: SessionState::PendingAuth,
            connection: None,
            bridge: None,
            auth_timer: None,
            idle_timer: None,
            attaching: None,
            created_at: now,
            last_activity: now,
            created_wall: Utc::now(),
        }
    }

    /// Whether a reattachment claim is in flight
    #[must_use]
    pub fn is_attaching(&self) -> bool {
        self.attaching.is_some()
    }

    /// Whether `connection_id` is the attached connection
    #[must_use]
    pub fn is_attached_to(&self, connection_id: ConnectionId) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.id() == connection_id)
    }

    /// Whether `connection_id` holds the reattachment claim
    #[must_use]
    pub fn is_claimed_by(&self, connection_id: ConnectionId) -> bool {
        self.attaching
            .as_ref()
            .is_some_and(|claim| claim.connection.id() == connection_id)
    }

    /// Record traffic
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Point-in-time view
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state,
            is_attaching: self.is_attaching(),
            connection_id: self.connection.as_ref().map(ConnectionHandle::id),
            has_process: self.bridge.is_some(),
            has_auth_timer: self.auth_timer.is_some(),
            has_idle_timer: self.idle_timer.is_some(),
            replay_bytes: self.bridge.as_ref().map_or(0, ProcessBridge::replay_len),
            credential_hash: self.credential_hash.map(|h| h.to_hex()),
            created_at: self.created_at,
            last_activity: self.last_activity,
            created_wall: self.created_wall,
        }
    }
}

/// Cloneable view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session identifier
    pub id: SessionId,
    /// Lifecycle state
    pub state: SessionState,
    /// Reattachment claim in flight
    pub is_attaching: bool,
    /// Attached connection
    pub connection_id: Option<ConnectionId>,
    /// Process bridge present
    pub has_process: bool,
    /// Auth timer pending
    pub has_auth_timer: bool,
    /// Idle timer pending
    pub has_idle_timer: bool,
    /// Bytes waiting for replay
    pub replay_bytes: usize,
    /// Hex credential fingerprint
    pub credential_hash: Option<String>,
    /// Monotonic creation time
    pub created_at: Instant,
    /// Monotonic time of the last traffic
    pub last_activity: Instant,
    /// Wall-clock creation time
    pub created_wall: DateTime<Utc>,
}
