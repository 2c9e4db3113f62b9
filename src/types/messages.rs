//! Client and server message types
//!
//! Control messages travel as JSON text frames tagged by `"type"`; terminal
//! output travels as raw binary frames. See [`crate::server::codec`] for the
//! frame-level mapping.

use serde::{Deserialize, Serialize};

use super::identifiers::SessionId;

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Columns
    pub cols: u16,
    /// Rows
    pub rows: u16,
}

impl TerminalSize {
    /// Create a terminal size
    #[must_use]
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Credentials presented by a connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// API key, `app.key:secret`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Access token (JWT)
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Credentials {
    /// Build credentials from optional parts
    #[must_use]
    pub fn new(api_key: Option<&str>, access_token: Option<&str>) -> Self {
        Self {
            api_key: api_key.map(str::to_string),
            access_token: access_token.map(str::to_string),
        }
    }
}

/// Inbound message from the browser terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Authenticate, optionally resuming an existing session
    Credentials {
        /// Presented credentials
        credentials: Credentials,
        /// Session to resume, if any
        resume_session_id: Option<SessionId>,
    },
    /// Keystrokes / pasted data for the process
    Input(Vec<u8>),
    /// Terminal resized
    Resize(TerminalSize),
}

/// Outbound message to the browser terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Process output bytes
    Output(Vec<u8>),
    /// Session identifier for later resumption
    SessionId(SessionId),
}

/// JSON shape of inbound control messages
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub(crate) enum WireClientMessage {
    Credentials {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default)]
        resume_session_id: Option<SessionId>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
}

impl From<WireClientMessage> for ClientMessage {
    fn from(wire: WireClientMessage) -> Self {
        match wire {
            WireClientMessage::Credentials {
                api_key,
                access_token,
                resume_session_id,
            } => Self::Credentials {
                credentials: Credentials {
                    api_key,
                    access_token,
                },
                resume_session_id,
            },
            WireClientMessage::Input { data } => Self::Input(data.into_bytes()),
            WireClientMessage::Resize { cols, rows } => Self::Resize(TerminalSize { cols, rows }),
        }
    }
}

/// JSON shape of outbound control messages
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum WireServerMessage<'a> {
    SessionId { value: &'a SessionId },
}
