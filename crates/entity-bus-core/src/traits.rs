//! Collaborator traits: transports, protocols and the session callback.
//!
//! A transport owns byte-stream connections. A protocol frames messages on
//! one connection and reports events to its session through
//! [`ProtocolCallback`]. Implementations must not call back into the
//! session from inside `send_message`, `connect` or `disconnect`; inbound
//! events are delivered from the transport's own task.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    message::{MessagePtr, ProtocolMessage},
    properties::{ConnectProperties, ProtocolData},
    types::ConnectionId,
};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Nothing listening on {0}")]
    NotListening(String),
    #[error("Endpoint already bound: {0}")]
    AlreadyBound(String),
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One byte-stream connection.
pub trait Connection: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    /// Queue payload chunks for sending. Returns false once the connection is closed.
    fn send(&self, payload: Vec<Bytes>) -> bool;

    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Whether the connection was accepted by a listener.
    fn is_incoming(&self) -> bool;

    fn endpoint(&self) -> String;

    /// Attach the protocol that receives this connection's events.
    fn set_protocol(&self, protocol: Weak<dyn Protocol>);
}

pub type ConnectionPtr = Arc<dyn Connection>;

/// Accepts connections arriving on a bound endpoint.
pub trait Acceptor: Send + Sync {
    /// Returns the protocol that will own the connection, or `None` to refuse it.
    fn accepted(&self, connection: ConnectionPtr) -> Option<ProtocolPtr>;
}

/// Creates and connects transport connections. Owns reconnect timing.
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(&self, protocol: Weak<dyn Protocol>) -> ConnectionPtr;

    /// Connect a connection created by [`Self::create_connection`].
    ///
    /// # Errors
    /// Returns error if the endpoint is malformed or unreachable.
    fn connect(
        &self,
        endpoint: &str,
        connection: &ConnectionPtr,
        properties: &ConnectProperties,
    ) -> Result<(), TransportError>;

    /// Start accepting connections on `endpoint`.
    ///
    /// # Errors
    /// Returns error if the endpoint is malformed or already bound.
    fn bind(&self, endpoint: &str, acceptor: Arc<dyn Acceptor>) -> Result<(), TransportError>;

    fn unbind(&self, endpoint: &str);
}

/// Fixed per-protocol capabilities, captured once when a session binds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ProtocolCapabilities {
    /// A message may be handed to the protocol more than once.
    pub messages_resendable: bool,
    /// The header travels as metainfo instead of inside the payload.
    pub supports_metainfo: bool,
    pub supports_session: bool,
    /// Replies without a correlation id must still be sent.
    pub needs_reply: bool,
    /// One session spans several connections.
    pub multi_connection_session: bool,
    /// Requests towards the client wait for the client to poll.
    pub send_request_by_poll: bool,
    pub supports_file_transfer: bool,
    /// Each connection carries exactly one request and one reply at a time.
    pub synchronous_request_reply: bool,
}

/// Builds empty messages for one protocol.
pub type MessageFactory = Arc<dyn Fn() -> ProtocolMessage + Send + Sync>;

/// Frames messages on a single connection.
pub trait Protocol: Send + Sync {
    fn set_callback(&self, callback: Weak<dyn ProtocolCallback>);

    fn set_connection(&self, connection: ConnectionPtr);

    fn connection(&self) -> Option<ConnectionPtr>;

    fn disconnect(&self);

    fn protocol_id(&self) -> u32;

    fn capabilities(&self) -> ProtocolCapabilities;

    fn message_factory(&self) -> MessageFactory;

    /// Returns false if the connection refused the message.
    fn send_message(&self, message: MessagePtr) -> bool;

    /// Take over buffered state from the protocol this one replaces.
    fn move_old_protocol_state(&self, _old: &dyn Protocol) {}

    /// Bundle queued messages into one poll reply.
    fn poll_reply(&self, messages: &[MessagePtr]) -> ProtocolMessage {
        let mut reply = (self.message_factory())();
        for message in messages {
            for chunk in message.send_payloads() {
                reply.add_send_payload(chunk.clone());
            }
        }
        reply
    }

    fn subscribe(&self, _subscriptions: &[String]) {}

    fn cycle_time(&self) {}

    /// Transport event: the connection is up.
    fn connected(&self, connection: &ConnectionPtr);

    /// Transport event: the connection is gone.
    fn disconnected(&self, connection: &ConnectionPtr);

    /// Transport event: bytes arrived.
    fn received(&self, connection: &ConnectionPtr, data: &[u8]);
}

pub type ProtocolPtr = Arc<dyn Protocol>;

/// Creates protocol instances for a registered protocol name.
pub trait ProtocolFactory: Send + Sync {
    fn create_protocol(&self, data: &ProtocolData) -> ProtocolPtr;
}

/// Events a protocol reports to the session that owns it.
pub trait ProtocolCallback: Send + Sync {
    fn connected(&self);

    fn disconnected(&self);

    fn disconnected_virtual_session(&self, virtual_session_id: &str);

    fn received(&self, message: ProtocolMessage, connection_id: ConnectionId);

    fn socket_connected(&self);

    fn socket_disconnected(&self);

    /// Open a fresh connection for the same protocol instance.
    fn reconnect(&self);

    /// Attach `protocol` to an existing session with this name.
    fn find_session_by_name(&self, name: &str, protocol: &ProtocolPtr) -> bool;

    fn set_session_name(&self, name: &str, protocol: &ProtocolPtr, connection: &ConnectionPtr);

    /// The client is waiting for queued requests.
    fn poll_request(&self, connection_id: ConnectionId, timeout_ms: i64, poll_count_max: i64);

    fn activity(&self);

    fn set_activity_timeout(&self, timeout_ms: i64);

    fn set_poll_max_requests(&self, max_requests: i64);

    /// One connection of a multi-connection session closed for good.
    fn disconnected_multi_connection(&self, connection_id: ConnectionId);

    /// A connection died while a request was in flight.
    fn connection_lost(&self, connection_id: ConnectionId);
}
