//! Protocol sessions and session management for the entity bus.
//!
//! This crate provides:
//! - `ProtocolSession` - binds a protocol, buffers, polls and pools requests
//! - `SessionManager` - binds endpoints, accepts and creates sessions
//! - `SessionList` - registry of live sessions
//! - `ProtocolRegistry` - protocol factories by name

pub mod list;
pub mod manager;
mod poll;
mod pool;
pub mod registry;
pub mod session;
pub mod timer;

#[cfg(test)]
mod testing;

use entity_bus_core::TransportError;

pub use list::SessionList;
pub use manager::SessionManager;
pub use registry::ProtocolRegistry;
pub use session::{ProtocolSession, SessionCallback, SessionEnv, SessionPtr};

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Session already bound to a protocol")]
    AlreadyBound,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Session error: {0}")]
    Internal(String),
}
