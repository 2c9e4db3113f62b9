//! # Terminal Session Broker
//!
//! A WebSocket terminal broker. Browser terminals connect, authenticate
//! with an API key or access token, and get an interactive shell whose
//! session survives the connection: a client that drops can reconnect with
//! its session id and pick up where it left off, including output produced
//! while it was away.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kodegen_terminal_broker::{
//!     Broker, BrokerConfig, CommandSpawner, FormatValidator, start_server,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::load(None)?;
//!     let broker = Arc::new(Broker::new(
//!         config.clone(),
//!         Arc::new(FormatValidator::new()),
//!         Arc::new(CommandSpawner::new(config.shell.clone())),
//!     ));
//!
//!     let server = start_server(&config, Arc::clone(&broker)).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol
//!
//! - The client sends `{"type":"credentials", ...}` as its first message,
//!   optionally with `resumeSessionId`, or connects with `?resume=<id>`.
//! - On success the broker replies `{"type":"sessionId","value":..}`.
//! - Terminal output arrives as binary frames. Input is sent as binary
//!   frames or `{"type":"input","data":..}`; `{"type":"resize",..}`
//!   resizes the terminal.
//! - Auth and resume failures close the socket with code 4001.
//! - Closing with code 1000 ends the session; any other disconnect keeps
//!   it for reattachment until the idle budget runs out.
//!
//! ## Embedding
//!
//! The broker never talks to a socket itself. [`Broker::connect`] takes
//! an outbound channel and returns a [`ClientConnection`] that accepts
//! decoded [`ClientMessage`]s, so the protocol runs the same with or
//! without the bundled [`server`]. Credential checks and process creation
//! are the [`CredentialValidator`] and [`ProcessSpawner`] seams.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod timers;
pub mod types;

// Re-export main types
pub use bridge::{
    CommandSpawner, OutputBuffer, ProcessControl, ProcessEvent, ProcessExit, ProcessSpawner,
    SpawnRequest, SpawnedProcess,
};
pub use broker::{Broker, ClientConnection, DisconnectIntent};
pub use config::{BrokerConfig, ShellConfig};
pub use credentials::{
    CredentialHash, CredentialValidator, FormatValidator, ValidationOutcome, ValidatorFn,
};
pub use error::{BrokerError, CloseFrame, Result, TerminationReason};
pub use registry::{EvictionBudgets, SessionRegistry};
pub use server::{ServerHandle, start_server, start_server_with_listener};
pub use session::{Outbound, SessionSnapshot, SessionState};
pub use timers::{TimerHandle, TimerId, TimerKind, TimerManager};
pub use types::{
    ClientMessage, ConnectionId, Credentials, ServerMessage, SessionEvent, SessionEventKind,
    SessionId, TerminalSize,
};
