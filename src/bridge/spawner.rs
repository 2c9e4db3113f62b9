//! Process collaborator interfaces
//!
//! The broker never builds a shell command itself. It asks a
//! [`ProcessSpawner`] for a [`SpawnedProcess`] and from then on only sees
//! three things: a byte sink for stdin, a stream of [`ProcessEvent`]s, and a
//! [`ProcessControl`] for resize and kill.

use futures::future::BoxFuture;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Credentials, SessionId, TerminalSize};

/// Parameters for one spawn
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Session the process belongs to
    pub session_id: SessionId,
    /// Initial terminal size
    pub size: TerminalSize,
    /// Credentials the session authenticated with
    pub credentials: Credentials,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    /// Whether the process exited with status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Event produced by a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Terminal output bytes, in production order
    Output(Vec<u8>),
    /// Process ended; always the last event
    Exited(ProcessExit),
}

/// Synchronous process controls
///
/// Called with the session registry locked, so implementations must not block.
pub trait ProcessControl: Send {
    /// Forward a terminal resize
    ///
    /// # Errors
    /// Returns error if the resize cannot be delivered
    fn resize(&mut self, size: TerminalSize) -> Result<()>;

    /// Request termination; idempotent
    fn kill(&mut self);
}

/// A spawned interactive process split into its parts
pub struct SpawnedProcess {
    /// Process stdin
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Output and exit events
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    /// Resize / kill
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess").finish_non_exhaustive()
    }
}

/// Process spawner collaborator
pub trait ProcessSpawner: Send + Sync {
    /// Start an interactive process for a session
    fn spawn(&self, request: SpawnRequest) -> BoxFuture<'_, Result<SpawnedProcess>>;
}
