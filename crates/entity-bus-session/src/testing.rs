//! Recording doubles for transports, protocols and session callbacks.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, AtomicI64, Ordering},
};

use bytes::Bytes;
use entity_bus_core::{
    Acceptor, Connection, ConnectionFactory, ConnectionId, ConnectionPtr, ConnectProperties,
    EchoData, MessageFactory, MessagePtr, Protocol, ProtocolCallback, ProtocolCapabilities,
    ProtocolData, ProtocolFactory, ProtocolMessage, ProtocolPtr, TransportError,
};

use crate::session::{SessionCallback, SessionPtr};

pub struct MockConnection {
    id: ConnectionId,
    incoming: bool,
    connected: AtomicBool,
    pub sent: Mutex<Vec<Bytes>>,
    protocol: Mutex<Option<Weak<dyn Protocol>>>,
}

impl MockConnection {
    pub fn new(id: ConnectionId, incoming: bool) -> Self {
        Self {
            id,
            incoming,
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            protocol: Mutex::new(None),
        }
    }
}

impl Connection for MockConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, payload: Vec<Bytes>) -> bool {
        self.sent.lock().unwrap().extend(payload);
        true
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn endpoint(&self) -> String {
        "mock".into()
    }

    fn set_protocol(&self, protocol: Weak<dyn Protocol>) {
        *self.protocol.lock().unwrap() = Some(protocol);
    }
}

/// Transport double that hands out sequential connection ids.
#[derive(Default)]
pub struct MockTransport {
    next_id: AtomicI64,
    pub created: Mutex<Vec<ConnectionPtr>>,
    pub connects: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl ConnectionFactory for MockTransport {
    fn create_connection(&self, protocol: Weak<dyn Protocol>) -> ConnectionPtr {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(MockConnection::new(id, false));
        connection.set_protocol(protocol);
        let connection: ConnectionPtr = connection;
        self.created.lock().unwrap().push(connection.clone());
        connection
    }

    fn connect(
        &self,
        endpoint: &str,
        _connection: &ConnectionPtr,
        _properties: &ConnectProperties,
    ) -> Result<(), TransportError> {
        self.connects.lock().unwrap().push(endpoint.to_owned());
        Ok(())
    }

    fn bind(&self, _endpoint: &str, _acceptor: Arc<dyn Acceptor>) -> Result<(), TransportError> {
        Ok(())
    }

    fn unbind(&self, _endpoint: &str) {}
}

/// Protocol double recording every message it is asked to send.
pub struct MockProtocol {
    id: u32,
    capabilities: ProtocolCapabilities,
    callback: Mutex<Option<Weak<dyn ProtocolCallback>>>,
    connection: Mutex<Option<ConnectionPtr>>,
    pub sent: Mutex<Vec<MessagePtr>>,
    pub refuse: AtomicBool,
    pub disconnected: AtomicBool,
}

impl MockProtocol {
    pub fn new(id: u32, capabilities: ProtocolCapabilities) -> Self {
        Self {
            id,
            capabilities,
            callback: Mutex::new(None),
            connection: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn plain() -> Self {
        Self::new(
            1,
            ProtocolCapabilities {
                messages_resendable: true,
                ..ProtocolCapabilities::default()
            },
        )
    }

    pub fn synchronous() -> Self {
        Self::new(
            2,
            ProtocolCapabilities {
                synchronous_request_reply: true,
                ..ProtocolCapabilities::default()
            },
        )
    }

    pub fn polled() -> Self {
        Self::new(
            3,
            ProtocolCapabilities {
                send_request_by_poll: true,
                messages_resendable: true,
                ..ProtocolCapabilities::default()
            },
        )
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> Option<MessagePtr> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn callback(&self) -> Option<Arc<dyn ProtocolCallback>> {
        self.callback.lock().unwrap().as_ref()?.upgrade()
    }

    /// Deliver an inbound message as if it arrived on the current connection.
    pub fn inject(&self, payload: &'static [u8]) {
        let connection_id = self
            .connection()
            .map_or(0, |connection| connection.connection_id());
        let mut message = ProtocolMessage::new(self.id);
        message.set_receive_payload(payload);
        if let Some(callback) = self.callback() {
            callback.received(message, connection_id);
        }
    }
}

impl Protocol for MockProtocol {
    fn set_callback(&self, callback: Weak<dyn ProtocolCallback>) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn set_connection(&self, connection: ConnectionPtr) {
        *self.connection.lock().unwrap() = Some(connection);
    }

    fn connection(&self) -> Option<ConnectionPtr> {
        self.connection.lock().unwrap().clone()
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn protocol_id(&self) -> u32 {
        self.id
    }

    fn capabilities(&self) -> ProtocolCapabilities {
        self.capabilities
    }

    fn message_factory(&self) -> MessageFactory {
        let id = self.id;
        Arc::new(move || ProtocolMessage::new(id))
    }

    fn send_message(&self, message: MessagePtr) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(message);
        true
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
        let mut message = ProtocolMessage::new(self.id);
        message.set_receive_payload(Bytes::copy_from_slice(data));
        if let Some(callback) = self.callback() {
            callback.received(message, connection.connection_id());
        }
    }
}

/// Factory handing out mock protocols and remembering them.
pub struct MockProtocolFactory {
    template: fn() -> MockProtocol,
    pub created: Mutex<Vec<Arc<MockProtocol>>>,
}

impl MockProtocolFactory {
    pub fn new(template: fn() -> MockProtocol) -> Self {
        Self {
            template,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn protocol(&self, index: usize) -> Arc<MockProtocol> {
        self.created.lock().unwrap()[index].clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl ProtocolFactory for MockProtocolFactory {
    fn create_protocol(&self, _data: &ProtocolData) -> ProtocolPtr {
        let protocol = Arc::new((self.template)());
        self.created.lock().unwrap().push(protocol.clone());
        protocol
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Connected,
    Disconnected,
    Received(Bytes),
    ConnectionLost(EchoData),
}

/// Session callback double.
#[derive(Default)]
pub struct RecordingCallback {
    pub events: Mutex<Vec<Recorded>>,
    pub messages: Mutex<Vec<MessagePtr>>,
}

impl RecordingCallback {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }
}

impl SessionCallback for RecordingCallback {
    fn connected(&self, _session: &SessionPtr) {
        self.events.lock().unwrap().push(Recorded::Connected);
    }

    fn disconnected(&self, _session: &SessionPtr) {
        self.events.lock().unwrap().push(Recorded::Disconnected);
    }

    fn disconnected_virtual_session(&self, _session: &SessionPtr, _virtual_session_id: &str) {}

    fn received(&self, _session: &SessionPtr, message: MessagePtr) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Received(message.receive_payload().clone()));
        self.messages.lock().unwrap().push(message);
    }

    fn socket_connected(&self, _session: &SessionPtr) {}

    fn socket_disconnected(&self, _session: &SessionPtr) {}

    fn request_connection_lost(&self, _session: &SessionPtr, echo_data: EchoData) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::ConnectionLost(echo_data));
    }
}
