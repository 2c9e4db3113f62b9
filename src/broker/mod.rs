//! Terminal session broker
//!
//! This module is organized into logical submodules:
//! - `core`: `Broker` struct, construction, inspection and shutdown
//! - `attach`: per-connection attachment protocol
//! - `lifecycle`: timer, claim and process driven state transitions
//! - `sweeper`: periodic eviction of idle and over-age sessions

mod attach;
mod core;
mod lifecycle;
mod sweeper;

pub use attach::{ClientConnection, DisconnectIntent};
pub use self::core::Broker;
