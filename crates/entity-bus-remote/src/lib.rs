//! Remote entities for the entity bus.
//!
//! This crate provides:
//! - `RemoteEntity` - commands, requests, replies and events between entities
//! - `PeerManager` - the peers of one entity and their sessions
//! - `RequestContext` - a handle that answers exactly one request
//! - `RemoteEntityContainer` - entity registry and inbound message routing
//! - `FormatRegistry` - content types, with JSON built in

pub mod container;
pub mod dispatch;
pub mod entity;
pub mod format;
pub mod json;
pub mod messages;
pub mod peer;
pub mod request_context;

#[cfg(test)]
mod testing;

pub use container::{ContainerConfig, ContainerError, RemoteEntityContainer};
pub use entity::{RemoteEntity, Reply, ReplyEventFn, Target};
pub use format::{CONTENT_TYPE_JSON, FormatError, FormatRegistry};
pub use messages::{StructValue, TypedMessage};
pub use peer::{PeerEventFn, PeerManager, PeerNotification};
pub use request_context::RequestContext;
