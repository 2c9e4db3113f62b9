//! Session lifecycle events
//!
//! Published on a broadcast channel so embedders can observe the broker
//! without reaching into the registry.

use chrono::{DateTime, Utc};

use super::identifiers::{ConnectionId, SessionId};
use crate::error::TerminationReason;

/// Lifecycle event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// Placeholder session allocated for a new connection
    Created,
    /// Credentials accepted, process attached
    Authenticated,
    /// Connection lost, session kept for reattachment
    Detached,
    /// A new connection reattached to the session
    Resumed,
    /// Session removed from the registry
    Terminated(TerminationReason),
}

/// Lifecycle event
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Session the event concerns
    pub session_id: SessionId,
    /// Connection involved, if any
    pub connection_id: Option<ConnectionId>,
    /// What happened
    pub kind: SessionEventKind,
    /// Wall-clock time of the event
    pub at: DateTime<Utc>,
}

impl SessionEvent {
    pub(crate) fn new(
        session_id: SessionId,
        connection_id: Option<ConnectionId>,
        kind: SessionEventKind,
    ) -> Self {
        Self {
            session_id,
            connection_id,
            kind,
            at: Utc::now(),
        }
    }
}
