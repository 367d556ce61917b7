//! Core abstractions for the entity bus.
//!
//! This crate provides the fundamental building blocks:
//! - `Header`, `Status`, `MsgMode` - the routing envelope
//! - `ProtocolMessage` - a framed message travelling through a session
//! - `EventHub` - broadcast + history for lifecycle notifications
//! - Transport, protocol and executor traits

pub mod event_hub;
pub mod executor;
pub mod header;
pub mod message;
pub mod properties;
pub mod traits;
pub mod types;

pub use event_hub::EventHub;
pub use executor::{Executor, ExecutorPtr, TokioExecutor};
pub use header::Header;
pub use message::{MessagePtr, ProtocolMessage};
pub use properties::{BindProperties, ConnectProperties, ProtocolData};
pub use traits::{
    Acceptor, Connection, ConnectionFactory, ConnectionPtr, MessageFactory, Protocol,
    ProtocolCallback, ProtocolCapabilities, ProtocolFactory, ProtocolPtr, TransportError,
};
pub use types::*;
