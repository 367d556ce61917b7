//! Reference transport collaborators for the entity bus.
//!
//! This crate provides:
//! - `MemoryTransport` - in-process connections on `mem://` endpoints
//! - `HeaderSizeProtocol` - 4 byte size prefixed framing, registered as `headersize`

pub mod memory;
pub mod protocol;

pub use memory::{MemoryConnection, MemoryTransport};
pub use protocol::{HeaderSizeProtocol, HeaderSizeProtocolFactory, PROTOCOL_NAME};
