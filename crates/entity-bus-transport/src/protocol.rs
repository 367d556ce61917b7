//! Length-prefixed framing protocol.
//!
//! Each message goes out as a 4 byte little-endian payload size followed by
//! the payload. The header travels inside the payload, so the protocol
//! reports no metainfo support.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use bytes::{Buf, BytesMut};
use entity_bus_core::{
    ConnectionPtr, MessageFactory, MessagePtr, Protocol, ProtocolCallback, ProtocolCapabilities,
    ProtocolData, ProtocolFactory, ProtocolMessage, ProtocolPtr,
};

pub const PROTOCOL_ID: u32 = 1;
pub const PROTOCOL_NAME: &str = "headersize";

const SIZE_PREFIX: usize = 4;

pub struct HeaderSizeProtocol {
    callback: RwLock<Option<Weak<dyn ProtocolCallback>>>,
    connection: Mutex<Option<ConnectionPtr>>,
    inbound: Mutex<BytesMut>,
}

impl Default for HeaderSizeProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderSizeProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self {
            callback: RwLock::new(None),
            connection: Mutex::new(None),
            inbound: Mutex::new(BytesMut::new()),
        }
    }

    fn callback(&self) -> Option<Arc<dyn ProtocolCallback>> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<ConnectionPtr>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Split complete frames off the receive buffer.
    fn take_frames(&self, data: &[u8]) -> Vec<ProtocolMessage> {
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        inbound.extend_from_slice(data);
        let mut frames = Vec::new();
        while inbound.len() >= SIZE_PREFIX {
            let mut prefix = [0u8; SIZE_PREFIX];
            prefix.copy_from_slice(&inbound[..SIZE_PREFIX]);
            let size = u32::from_le_bytes(prefix) as usize;
            if inbound.len() < SIZE_PREFIX + size {
                break;
            }
            inbound.advance(SIZE_PREFIX);
            let mut message = ProtocolMessage::new(PROTOCOL_ID);
            message.set_receive_payload(inbound.split_to(size).freeze());
            frames.push(message);
        }
        frames
    }
}

impl Protocol for HeaderSizeProtocol {
    fn set_callback(&self, callback: Weak<dyn ProtocolCallback>) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn set_connection(&self, connection: ConnectionPtr) {
        *self.lock_connection() = Some(connection);
    }

    fn connection(&self) -> Option<ConnectionPtr> {
        self.lock_connection().clone()
    }

    fn disconnect(&self) {
        let connection = self.lock_connection().clone();
        if let Some(connection) = connection {
            connection.disconnect();
        }
    }

    fn protocol_id(&self) -> u32 {
        PROTOCOL_ID
    }

    fn capabilities(&self) -> ProtocolCapabilities {
        ProtocolCapabilities {
            messages_resendable: true,
            ..ProtocolCapabilities::default()
        }
    }

    fn message_factory(&self) -> MessageFactory {
        Arc::new(|| ProtocolMessage::new(PROTOCOL_ID))
    }

    fn send_message(&self, message: MessagePtr) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        let Ok(size) = u32::try_from(message.total_send_payload_size()) else {
            tracing::error!("message too large for a size prefix");
            return false;
        };
        let mut payload = Vec::with_capacity(message.send_payloads().len() + 1);
        payload.push(bytes::Bytes::copy_from_slice(&size.to_le_bytes()));
        payload.extend(message.send_payloads().iter().cloned());
        connection.send(payload)
    }

    fn connected(&self, _connection: &ConnectionPtr) {
        if let Some(callback) = self.callback() {
            callback.connected();
        }
    }

    fn disconnected(&self, _connection: &ConnectionPtr) {
        if let Some(callback) = self.callback() {
            callback.disconnected();
        }
    }

    fn received(&self, connection: &ConnectionPtr, data: &[u8]) {
        let frames = self.take_frames(data);
        let Some(callback) = self.callback() else {
            return;
        };
        for frame in frames {
            callback.received(frame, connection.connection_id());
        }
    }
}

/// Registers as [`PROTOCOL_NAME`].
#[derive(Debug, Default)]
pub struct HeaderSizeProtocolFactory;

impl ProtocolFactory for HeaderSizeProtocolFactory {
    fn create_protocol(&self, _data: &ProtocolData) -> ProtocolPtr {
        Arc::new(HeaderSizeProtocol::new())
    }
}
