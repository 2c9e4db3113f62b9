//! Pseudo-terminal implementation of [`ProcessSpawner`]
//!
//! Runs the configured shell on the slave side of a `portable-pty` pair, so
//! the shell sees a real terminal: line discipline, job control and a window
//! size that follows the browser via [`ProcessControl::resize`]. The master
//! side is blocking, so reads and writes run on `spawn_blocking` threads.
//! `Exited` is only emitted after the reader hits EOF so it is always the
//! last event.

use futures::future::BoxFuture;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::config::{DANGEROUS_ENV_VARS, ShellConfig};
use crate::error::{BrokerError, Result};
use crate::types::TerminalSize;

use super::spawner::{
    ProcessControl, ProcessEvent, ProcessExit, ProcessSpawner, SpawnRequest, SpawnedProcess,
};

/// Read chunk size for the pty master
const READ_CHUNK_BYTES: usize = 8192;

/// Buffer between the bridge's stdin writer and the pty writer thread
const INPUT_PIPE_BYTES: usize = 8192;

/// How long to wait for the output reader after the child exits
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawns the configured shell on a pseudo-terminal for each session
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    shell: ShellConfig,
}

impl CommandSpawner {
    /// Create a spawner for a shell configuration
    #[must_use]
    pub fn new(shell: ShellConfig) -> Self {
        Self { shell }
    }

    /// Environment for a spawn: filtered inherited vars and extras, terminal hints, credentials
    fn environment(&self, request: &SpawnRequest) -> HashMap<String, String> {
        let mut env = std::env::vars()
            .filter(|(key, _)| !DANGEROUS_ENV_VARS.contains(&key.as_str()))
            .collect::<HashMap<_, _>>();

        for (key, value) in &self.shell.env {
            if DANGEROUS_ENV_VARS.contains(&key.as_str()) {
                log::warn!("Ignoring dangerous shell environment variable {key}");
                continue;
            }
            env.insert(key.clone(), value.clone());
        }

        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("COLUMNS".to_string(), request.size.cols.to_string());
        env.insert("LINES".to_string(), request.size.rows.to_string());

        if let (Some(name), Some(value)) = (&self.shell.api_key_env, &request.credentials.api_key) {
            env.insert(name.clone(), value.clone());
        }
        if let (Some(name), Some(value)) = (
            &self.shell.access_token_env,
            &request.credentials.access_token,
        ) {
            env.insert(name.clone(), value.clone());
        }

        env
    }

    fn command(&self, request: &SpawnRequest) -> Result<CommandBuilder> {
        let mut cmd = CommandBuilder::new(&self.shell.program);
        cmd.args(&self.shell.args);
        cmd.env_clear();
        for (key, value) in self.environment(request) {
            cmd.env(key, value);
        }

        if let Some(ref cwd) = self.shell.cwd {
            if !cwd.is_dir() {
                return Err(BrokerError::spawn(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                )));
            }
            cmd.cwd(cwd);
        }
        Ok(cmd)
    }

    fn spawn_impl(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        let cmd = self.command(request)?;

        let PtyPair { master, slave } = native_pty_system()
            .openpty(pty_size(request.size))
            .map_err(|e| BrokerError::spawn(format!("Failed to open pty: {e}")))?;

        let mut child = slave
            .spawn_command(cmd)
            .map_err(|e| BrokerError::spawn(format!("{}: {e}", self.shell.program.display())))?;
        // Only the child keeps the slave open, so the reader sees EOF when it exits
        drop(slave);

        let killer = child.clone_killer();
        let reader = master
            .try_clone_reader()
            .map_err(|e| BrokerError::spawn(format!("Failed to get pty reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| BrokerError::spawn(format!("Failed to get pty writer: {e}")))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader_task = spawn_reader(reader, events_tx.clone());
        let stdin = spawn_writer(writer);

        let session_id = request.session_id.clone();
        let pid = child.process_id();

        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;

            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_task)
                .await
                .is_err()
            {
                log::warn!("[{session_id}] Output reader did not drain after exit");
            }

            let code = match status {
                Ok(Ok(status)) => i32::try_from(status.exit_code()).ok(),
                Ok(Err(e)) => {
                    log::warn!("[{session_id}] Failed to wait for process {pid:?}: {e}");
                    None
                }
                Err(e) => {
                    log::warn!("[{session_id}] Wait task failed: {e}");
                    None
                }
            };
            let _ = events_tx.send(ProcessEvent::Exited(ProcessExit { code }));
        });

        log::debug!(
            "[{}] Spawned {} on a {}x{} pty (pid {pid:?})",
            request.session_id,
            self.shell.program.display(),
            request.size.cols,
            request.size.rows
        );

        Ok(SpawnedProcess {
            stdin: Box::new(stdin),
            events: events_rx,
            control: Box::new(PtyControl {
                master,
                killer,
                killed: false,
            }),
        })
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, request: SpawnRequest) -> BoxFuture<'_, Result<SpawnedProcess>> {
        Box::pin(async move { self.spawn_impl(&request) })
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(ProcessEvent::Output(buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                // EIO once the slave side is closed
                Err(_) => break,
            }
        }
    })
}

/// Async stdin for the bridge, drained into the blocking pty writer
fn spawn_writer(mut writer: Box<dyn Write + Send>) -> tokio::io::DuplexStream {
    let (stdin, mut input) = tokio::io::duplex(INPUT_PIPE_BYTES);

    tokio::spawn(async move {
        let mut buffer = vec![0u8; INPUT_PIPE_BYTES];
        loop {
            let n = match input.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = buffer[..n].to_vec();
            let written = tokio::task::spawn_blocking(move || {
                let result = writer.write_all(&chunk).and_then(|()| writer.flush());
                (writer, result)
            })
            .await;

            match written {
                Ok((returned, Ok(()))) => writer = returned,
                Ok((_, Err(e))) => {
                    log::debug!("pty write failed: {e}");
                    break;
                }
                Err(_) => break,
            }
        }
    });

    stdin
}

/// Controls for a pty-backed child process
struct PtyControl {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    killed: bool,
}

impl ProcessControl for PtyControl {
    fn resize(&mut self, size: TerminalSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| BrokerError::pty(format!("resize to {}x{}: {e}", size.cols, size.rows)))
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        // Fails harmlessly if the child already exited
        let _ = self.killer.kill();
    }
}
