//! A session bound to a recording protocol, for unit tests.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicI64, Ordering},
};

use bytes::Bytes;
use entity_bus_core::{
    Acceptor, Connection, ConnectionFactory, ConnectionId, ConnectionPtr, ConnectProperties,
    EchoData, MessageFactory, MessagePtr, Protocol, ProtocolCallback, ProtocolCapabilities,
    ProtocolData, ProtocolFactory, ProtocolMessage, ProtocolPtr, TransportError,
};
use entity_bus_session::{
    ProtocolRegistry, ProtocolSession, SessionCallback, SessionEnv, SessionList, SessionPtr,
};

use crate::format::{CONTENT_TYPE_JSON, FormatRegistry, ParsedMessage};

struct NullConnection(ConnectionId);

impl Connection for NullConnection {
    fn connection_id(&self) -> ConnectionId {
        self.0
    }

    fn send(&self, _payload: Vec<Bytes>) -> bool {
        true
    }

    fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }

    fn is_incoming(&self) -> bool {
        false
    }

    fn endpoint(&self) -> String {
        "test".into()
    }

    fn set_protocol(&self, _protocol: Weak<dyn Protocol>) {}
}

#[derive(Default)]
struct NullTransport {
    next_id: AtomicI64,
}

impl ConnectionFactory for NullTransport {
    fn create_connection(&self, _protocol: Weak<dyn Protocol>) -> ConnectionPtr {
        Arc::new(NullConnection(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn connect(
        &self,
        _endpoint: &str,
        _connection: &ConnectionPtr,
        _properties: &ConnectProperties,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn bind(&self, _endpoint: &str, _acceptor: Arc<dyn Acceptor>) -> Result<(), TransportError> {
        Ok(())
    }

    fn unbind(&self, _endpoint: &str) {}
}

/// Protocol that keeps every message it is asked to send.
pub struct RecordingProtocol {
    capabilities: ProtocolCapabilities,
    connection: Mutex<Option<ConnectionPtr>>,
    pub sent: Mutex<Vec<MessagePtr>>,
}

impl Protocol for RecordingProtocol {
    fn set_callback(&self, _callback: Weak<dyn ProtocolCallback>) {}

    fn set_connection(&self, connection: ConnectionPtr) {
        *self.connection.lock().unwrap() = Some(connection);
    }

    fn connection(&self) -> Option<ConnectionPtr> {
        self.connection.lock().unwrap().clone()
    }

    fn disconnect(&self) {}

    fn protocol_id(&self) -> u32 {
        7
    }

    fn capabilities(&self) -> ProtocolCapabilities {
        self.capabilities
    }

    fn message_factory(&self) -> MessageFactory {
        Arc::new(|| ProtocolMessage::new(7))
    }

    fn send_message(&self, message: MessagePtr) -> bool {
        self.sent.lock().unwrap().push(message);
        true
    }

    fn connected(&self, _connection: &ConnectionPtr) {}

    fn disconnected(&self, _connection: &ConnectionPtr) {}

    fn received(&self, _connection: &ConnectionPtr, _data: &[u8]) {}
}

struct RecordingFactory {
    capabilities: ProtocolCapabilities,
    created: Mutex<Option<Arc<RecordingProtocol>>>,
}

impl ProtocolFactory for RecordingFactory {
    fn create_protocol(&self, _data: &ProtocolData) -> ProtocolPtr {
        let protocol = Arc::new(RecordingProtocol {
            capabilities: self.capabilities,
            connection: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        });
        *self.created.lock().unwrap() = Some(protocol.clone());
        protocol
    }
}

struct NullCallback;

impl SessionCallback for NullCallback {
    fn connected(&self, _session: &SessionPtr) {}

    fn disconnected(&self, _session: &SessionPtr) {}

    fn disconnected_virtual_session(&self, _session: &SessionPtr, _virtual_session_id: &str) {}

    fn received(&self, _session: &SessionPtr, _message: MessagePtr) {}

    fn socket_connected(&self, _session: &SessionPtr) {}

    fn socket_disconnected(&self, _session: &SessionPtr) {}

    fn request_connection_lost(&self, _session: &SessionPtr, _echo_data: EchoData) {}
}

/// A connected JSON session whose protocol records what is sent.
pub struct Harness {
    pub session: SessionPtr,
    pub protocol: Arc<RecordingProtocol>,
    pub formats: Arc<FormatRegistry>,
    _list: Arc<SessionList>,
}

impl Harness {
    pub fn new(capabilities: ProtocolCapabilities) -> Self {
        let factory = Arc::new(RecordingFactory {
            capabilities,
            created: Mutex::new(None),
        });
        let protocols = Arc::new(ProtocolRegistry::new());
        protocols.register("rec", factory.clone());
        let list = Arc::new(SessionList::new());
        let callback: Weak<dyn SessionCallback> = Weak::<NullCallback>::new();
        let env = SessionEnv {
            callback,
            executor: None,
            list: list.clone(),
            protocols,
            transport: Arc::new(NullTransport::default()),
        };
        let session = ProtocolSession::outgoing(&env, CONTENT_TYPE_JSON);
        session
            .connect("test://peer:rec", &ConnectProperties::new())
            .unwrap();
        let protocol = factory.created.lock().unwrap().clone().unwrap();
        Self {
            session,
            protocol,
            formats: Arc::new(FormatRegistry::new()),
            _list: list,
        }
    }

    pub fn plain() -> Self {
        Self::new(ProtocolCapabilities {
            messages_resendable: true,
            ..ProtocolCapabilities::default()
        })
    }

    pub fn with_metainfo() -> Self {
        Self::new(ProtocolCapabilities {
            messages_resendable: true,
            supports_metainfo: true,
            ..ProtocolCapabilities::default()
        })
    }

    /// Everything sent so far, decoded.
    pub fn sent(&self) -> Vec<ParsedMessage> {
        self.protocol
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|message| self.formats.parse(&self.session, message))
            .collect()
    }
}
