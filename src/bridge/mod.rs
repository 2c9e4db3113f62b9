//! Process Bridge
//!
//! Owns one interactive process per session and moves bytes between it and
//! whichever connection is currently attached. Two background tasks do the
//! work:
//!
//! - the writer drains an input channel into the process stdin, so input
//!   order is preserved and a full stdin pipe never stalls output;
//! - the pump forwards process events, in production order, to an
//!   [`OutputSink`] (the broker), which routes output to the attached
//!   connection or into this bridge's replay buffer.
//!
//! # Module Structure
//!
//! - `spawner` - collaborator traits (`ProcessSpawner`, `ProcessControl`)
//! - `pty` - pseudo-terminal spawner
//! - `buffer` - bounded replay buffer

pub mod buffer;
pub mod pty;
pub mod spawner;

use std::sync::Weak;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::types::{SessionId, TerminalSize};

pub use buffer::OutputBuffer;
pub use spawner::{
    ProcessControl, ProcessEvent, ProcessExit, ProcessSpawner, SpawnRequest, SpawnedProcess,
};
pub use pty::CommandSpawner;

/// Receiver of process output and exit notifications
pub trait OutputSink: Send + Sync {
    /// A chunk of output was produced
    fn on_output(&self, session_id: &SessionId, chunk: Vec<u8>);

    /// The process ended
    fn on_exit(&self, session_id: &SessionId, exit: ProcessExit);
}

/// Running process attached to a session
pub struct ProcessBridge {
    session_id: SessionId,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    control: Box<dyn ProcessControl>,
    replay: OutputBuffer,
    writer_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl ProcessBridge {
    /// Start the writer and pump tasks for a spawned process
    pub fn start(
        session_id: SessionId,
        process: SpawnedProcess,
        sink: Weak<dyn OutputSink>,
        replay_capacity: usize,
    ) -> Self {
        let SpawnedProcess {
            mut stdin,
            mut events,
            control,
        } = process;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_id = session_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                let written = match stdin.write_all(&data).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    log::warn!("[{writer_id}] Failed to write to process stdin: {e}");
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        let pump_id = session_id.clone();
        let pump_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(sink) = sink.upgrade() else {
                    break;
                };
                match event {
                    ProcessEvent::Output(chunk) => sink.on_output(&pump_id, chunk),
                    ProcessEvent::Exited(exit) => {
                        sink.on_exit(&pump_id, exit);
                        return;
                    }
                }
            }
            // Event stream ended without an exit status
            if let Some(sink) = sink.upgrade() {
                sink.on_exit(&pump_id, ProcessExit { code: None });
            }
        });

        Self {
            session_id,
            input_tx,
            control,
            replay: OutputBuffer::new(replay_capacity),
            writer_task,
            pump_task,
        }
    }

    /// Queue input for the process; false if the writer has stopped
    pub fn send_input(&self, data: Vec<u8>) -> bool {
        self.input_tx.send(data).is_ok()
    }

    /// Forward a resize
    ///
    /// # Errors
    /// Returns error if the process control rejects the resize
    pub fn resize(&mut self, size: TerminalSize) -> Result<()> {
        self.control.resize(size)
    }

    /// Keep output produced while no connection is attached
    pub fn buffer_output(&mut self, chunk: &[u8]) {
        self.replay.push(chunk);
    }

    /// Drain buffered output for replay to a reattached connection
    pub fn take_replay(&mut self) -> Vec<u8> {
        self.replay.take()
    }

    /// Bytes currently buffered for replay
    #[must_use]
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Kill the process and stop both tasks
    pub fn kill(mut self) {
        log::debug!("[{}] Killing process bridge", self.session_id);
        self.control.kill();
        self.writer_task.abort();
        self.pump_task.abort();
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        // Idempotent with `kill`
        self.control.kill();
        self.writer_task.abort();
        self.pump_task.abort();
    }
}

impl std::fmt::Debug for ProcessBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBridge")
            .field("session_id", &self.session_id)
            .field("replay_len", &self.replay.len())
            .finish_non_exhaustive()
    }
}
