//! Type definitions for the terminal broker
//!
//! - [`identifiers`] - Type-safe ID wrappers (`SessionId`, `ConnectionId`)
//! - [`messages`] - Client/server message kinds and terminal sizes
//! - [`events`] - Lifecycle events published by the broker

pub mod events;
pub mod identifiers;
pub mod messages;

pub use events::{SessionEvent, SessionEventKind};
pub use identifiers::{ConnectionId, SessionId};
pub use messages::{ClientMessage, Credentials, ServerMessage, TerminalSize};
