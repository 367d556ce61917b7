//! Framed messages travelling between sessions and protocols.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Bytes, BytesMut};

use crate::types::{ControlData, EchoData, Metainfo};

/// Echo data key holding the connection a multi-connection message belongs to.
pub const ECHO_CONNECTION_ID: &str = "fmq_echo_connid";

/// Echo data keys used to recover a reply header on request/reply transports.
pub const ECHO_CORRELATION_ID: &str = "fmq_corrid";
pub const ECHO_SOURCE_ID: &str = "fmq_srcid";

/// Control data key marking an empty poll reply that ends a long poll.
pub const CONTROL_POLL_STOP: &str = "fmq_poll_stop";

/// Control data key carrying a virtual session id.
pub const CONTROL_VIRTUAL_SESSION_ID: &str = "fmq_virtsessid";

/// Shared handle to a message.
pub type MessagePtr = Arc<ProtocolMessage>;

/// A message framed for one protocol.
///
/// Outbound messages carry one or more send payloads, inbound ones a
/// single receive payload. Once wrapped in [`MessagePtr`] a message is
/// immutable apart from its sent flag and conversion cache.
#[derive(Debug, Default)]
pub struct ProtocolMessage {
    protocol_id: u32,
    send_payloads: Vec<Bytes>,
    receive_payload: Bytes,
    metainfo: Metainfo,
    echo_data: EchoData,
    control_data: ControlData,
    was_sent: AtomicBool,
    converted: Mutex<HashMap<u32, MessagePtr>>,
}

impl ProtocolMessage {
    #[must_use]
    pub fn new(protocol_id: u32) -> Self {
        Self {
            protocol_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    /// Append an outbound payload chunk.
    pub fn add_send_payload(&mut self, payload: impl Into<Bytes>) {
        self.send_payloads.push(payload.into());
    }

    #[must_use]
    pub fn send_payloads(&self) -> &[Bytes] {
        &self.send_payloads
    }

    #[must_use]
    pub fn total_send_payload_size(&self) -> usize {
        self.send_payloads.iter().map(Bytes::len).sum()
    }

    /// Outbound chunks joined into one buffer.
    #[must_use]
    pub fn joined_send_payload(&self) -> Bytes {
        match self.send_payloads.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut buf = BytesMut::with_capacity(self.total_send_payload_size());
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    pub fn set_receive_payload(&mut self, payload: impl Into<Bytes>) {
        self.receive_payload = payload.into();
    }

    #[must_use]
    pub const fn receive_payload(&self) -> &Bytes {
        &self.receive_payload
    }

    #[must_use]
    pub const fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub const fn metainfo_mut(&mut self) -> &mut Metainfo {
        &mut self.metainfo
    }

    #[must_use]
    pub const fn echo_data(&self) -> &EchoData {
        &self.echo_data
    }

    pub const fn echo_data_mut(&mut self) -> &mut EchoData {
        &mut self.echo_data
    }

    #[must_use]
    pub const fn control_data(&self) -> &ControlData {
        &self.control_data
    }

    pub const fn control_data_mut(&mut self) -> &mut ControlData {
        &mut self.control_data
    }

    /// Whether the message has been handed to a protocol at least once.
    #[must_use]
    pub fn was_sent(&self) -> bool {
        self.was_sent.load(Ordering::Acquire)
    }

    pub fn mark_sent(&self) {
        self.was_sent.store(true, Ordering::Release);
    }

    /// Cached conversion of this message for another protocol.
    #[must_use]
    pub fn cached_conversion(&self, protocol_id: u32) -> Option<MessagePtr> {
        self.converted
            .lock()
            .ok()
            .and_then(|cache| cache.get(&protocol_id).cloned())
    }

    pub fn cache_conversion(&self, message: MessagePtr) {
        if let Ok(mut cache) = self.converted.lock() {
            cache.insert(message.protocol_id(), message);
        }
    }

    /// Whether the message is an empty poll reply ending a long poll.
    #[must_use]
    pub fn is_poll_stop(&self) -> bool {
        self.control_data
            .get(CONTROL_POLL_STOP)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}
