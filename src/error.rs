//! Error types for the terminal session broker
//!
//! Two layers live here. [`BrokerError`] is the ordinary crate error returned by
//! fallible operations (spawning, config loading, socket I/O). [`TerminationReason`]
//! is the per-session failure taxonomy: every way a session or a connection attempt
//! can end, together with the WebSocket close frame the client receives.

use thiserror::Error;

/// Close code sent when credentials are rejected or a resume attempt is refused
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away (broker shutdown)
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Unexpected condition on the server side (process failure)
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Server overloaded, client may retry later
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Main error type for the terminal broker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Session identifier already registered
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Registry is at capacity
    #[error("Maximum sessions reached: {0}")]
    MaxSessionsReached(usize),

    /// Interactive process could not be started
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// Pseudo-terminal operation failed
    #[error("PTY error: {0}")]
    Pty(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed client frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parse error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Create a session exists error
    pub fn session_exists(session_id: impl Into<String>) -> Self {
        Self::SessionExists(session_id.into())
    }

    /// Create a max sessions error
    #[must_use]
    pub fn max_sessions_reached(max: usize) -> Self {
        Self::MaxSessionsReached(max)
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a pty error
    pub fn pty(msg: impl Into<String>) -> Self {
        Self::Pty(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Close frame delivered to a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// WebSocket close code
    pub code: u16,
    /// Human-readable reason
    pub reason: String,
}

impl CloseFrame {
    /// Build a close frame
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Why a session ended, or why a connection attempt was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// No credentials arrived within the auth budget
    AuthTimeout,
    /// The credential validator refused the credentials
    AuthRejected,
    /// Resume credentials hash differs from the session's
    ResumeMismatch,
    /// Another reattachment is already in flight for the session
    ResumeConflict,
    /// The interactive process exited
    ProcessExited {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
    },
    /// The interactive process could not be started
    SpawnFailed,
    /// No traffic within the idle budget
    IdleExpired,
    /// Absolute lifetime exceeded
    LifetimeExpired,
    /// Client closed the connection with end-of-session intent
    ClientClosed,
    /// Registry is at capacity
    CapacityReached,
    /// Placeholder replaced by a resume of another session
    Superseded,
    /// Broker is shutting down
    Shutdown,
}

impl TerminationReason {
    /// Close frame delivered to the client for this reason
    #[must_use]
    pub fn close_frame(&self) -> CloseFrame {
        match self {
            Self::AuthTimeout => CloseFrame::new(CLOSE_AUTH_FAILED, "Authentication timeout"),
            Self::AuthRejected => CloseFrame::new(CLOSE_AUTH_FAILED, "Invalid token"),
            Self::ResumeMismatch => {
                CloseFrame::new(CLOSE_AUTH_FAILED, "Session credentials mismatch")
            }
            Self::ResumeConflict => {
                CloseFrame::new(CLOSE_AUTH_FAILED, "Session resume already in progress")
            }
            Self::ProcessExited { code: Some(0) } => CloseFrame::new(CLOSE_NORMAL, "Process exited"),
            Self::ProcessExited { code: Some(code) } => CloseFrame::new(
                CLOSE_INTERNAL_ERROR,
                format!("Process exited with status {code}"),
            ),
            Self::ProcessExited { code: None } => {
                CloseFrame::new(CLOSE_INTERNAL_ERROR, "Process terminated by signal")
            }
            Self::SpawnFailed => CloseFrame::new(CLOSE_INTERNAL_ERROR, "Failed to start process"),
            Self::IdleExpired => CloseFrame::new(CLOSE_NORMAL, "Session idle timeout"),
            Self::LifetimeExpired => CloseFrame::new(CLOSE_NORMAL, "Session lifetime exceeded"),
            Self::ClientClosed => CloseFrame::new(CLOSE_NORMAL, "Session closed by client"),
            Self::CapacityReached => CloseFrame::new(CLOSE_TRY_AGAIN_LATER, "Too many sessions"),
            Self::Superseded => CloseFrame::new(CLOSE_NORMAL, "Session superseded"),
            Self::Shutdown => CloseFrame::new(CLOSE_GOING_AWAY, "Server shutting down"),
        }
    }

    /// Short label for logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthTimeout => "auth_timeout",
            Self::AuthRejected => "auth_rejected",
            Self::ResumeMismatch => "resume_mismatch",
            Self::ResumeConflict => "resume_conflict",
            Self::ProcessExited { .. } => "process_exited",
            Self::SpawnFailed => "spawn_failed",
            Self::IdleExpired => "idle_expired",
            Self::LifetimeExpired => "lifetime_expired",
            Self::ClientClosed => "client_closed",
            Self::CapacityReached => "capacity_reached",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
