//! In-process transport.
//!
//! Every connection owns a delivery task that feeds its protocol. Sending on
//! one end queues bytes for the task of the other end, so protocol events are
//! never raised from inside a send.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicI64, Ordering},
    },
};

use bytes::Bytes;
use entity_bus_core::{
    Acceptor, ConnectProperties, Connection, ConnectionFactory, ConnectionId, ConnectionPtr,
    Protocol, TransportError,
};
use tokio::{runtime::Handle, sync::mpsc};

enum Delivery {
    Connected,
    Data(Bytes),
    Closed,
}

#[derive(Default)]
struct LinkState {
    peer: Option<Weak<MemoryConnection>>,
    /// Sent before the connection was paired.
    pending: Vec<Bytes>,
    closed: bool,
}

/// One end of an in-process connection.
pub struct MemoryConnection {
    id: ConnectionId,
    incoming: bool,
    endpoint: String,
    protocol: RwLock<Option<Weak<dyn Protocol>>>,
    link: Mutex<LinkState>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl MemoryConnection {
    fn spawn(handle: &Handle, id: ConnectionId, incoming: bool, endpoint: &str) -> Arc<Self> {
        let (deliveries, mut receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            incoming,
            endpoint: endpoint.to_owned(),
            protocol: RwLock::new(None),
            link: Mutex::new(LinkState::default()),
            deliveries,
        });
        let this = Arc::downgrade(&connection);
        handle.spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let Some(connection) = this.upgrade() else {
                    break;
                };
                let closed = matches!(delivery, Delivery::Closed);
                connection.deliver(delivery);
                if closed {
                    break;
                }
            }
        });
        connection
    }

    fn lock_link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn deliver(self: Arc<Self>, delivery: Delivery) {
        let Some(protocol) = self.protocol() else {
            tracing::debug!(connection = self.id, "no protocol, dropping delivery");
            return;
        };
        let connection: ConnectionPtr = self;
        match delivery {
            Delivery::Connected => protocol.connected(&connection),
            Delivery::Data(data) => protocol.received(&connection, &data),
            Delivery::Closed => protocol.disconnected(&connection),
        }
    }

    fn queue(&self, delivery: Delivery) {
        // the receiver only goes away after Closed
        let _ = self.deliveries.send(delivery);
    }

    fn pair(&self, peer: &Arc<Self>) {
        let pending = {
            let mut link = self.lock_link();
            link.peer = Some(Arc::downgrade(peer));
            std::mem::take(&mut link.pending)
        };
        self.queue(Delivery::Connected);
        for data in pending {
            peer.queue(Delivery::Data(data));
        }
    }

    /// Close this end without notifying the peer.
    fn close_local(&self) -> Option<Weak<Self>> {
        let peer = {
            let mut link = self.lock_link();
            if std::mem::replace(&mut link.closed, true) {
                return None;
            }
            link.pending.clear();
            link.peer.take()
        };
        self.queue(Delivery::Closed);
        peer
    }
}

impl Connection for MemoryConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, payload: Vec<Bytes>) -> bool {
        let peer = {
            let mut link = self.lock_link();
            if link.closed {
                return false;
            }
            match link.peer.as_ref().and_then(Weak::upgrade) {
                Some(peer) => peer,
                None => {
                    link.pending.extend(payload);
                    return true;
                }
            }
        };
        let data = match <[Bytes; 1]>::try_from(payload) {
            Ok([single]) => single,
            Err(chunks) => Bytes::from(chunks.concat()),
        };
        peer.queue(Delivery::Data(data));
        true
    }

    fn disconnect(&self) {
        if let Some(peer) = self.close_local().and_then(|peer| peer.upgrade()) {
            peer.close_local();
        }
    }

    fn is_connected(&self) -> bool {
        let link = self.lock_link();
        !link.closed && link.peer.is_some()
    }

    fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn set_protocol(&self, protocol: Weak<dyn Protocol>) {
        *self
            .protocol
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(protocol);
    }
}

/// Connection factory for in-process endpoints such as `mem://server`.
pub struct MemoryTransport {
    handle: Handle,
    next_connection_id: AtomicI64,
    listeners: Mutex<HashMap<String, Arc<dyn Acceptor>>>,
    connections: Mutex<HashMap<ConnectionId, Weak<MemoryConnection>>>,
}

impl MemoryTransport {
    /// Create a transport whose delivery tasks run on `handle`.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_connection_id: AtomicI64::new(1),
            listeners: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Create a transport on the current runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    fn create(&self, incoming: bool, endpoint: &str) -> Arc<MemoryConnection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = MemoryConnection::spawn(&self.handle, id, incoming, endpoint);
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        connections.retain(|_, c| c.strong_count() > 0);
        connections.insert(id, Arc::downgrade(&connection));
        connection
    }

    fn lookup(&self, id: ConnectionId) -> Option<Arc<MemoryConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(Weak::upgrade)
    }
}

impl ConnectionFactory for MemoryTransport {
    fn create_connection(&self, protocol: Weak<dyn Protocol>) -> ConnectionPtr {
        let connection = self.create(false, "");
        connection.set_protocol(protocol);
        connection
    }

    fn connect(
        &self,
        endpoint: &str,
        connection: &ConnectionPtr,
        _properties: &ConnectProperties,
    ) -> Result<(), TransportError> {
        let client = self
            .lookup(connection.connection_id())
            .ok_or(TransportError::ConnectionClosed(connection.connection_id()))?;
        let acceptor = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::NotListening(endpoint.to_owned()))?;

        let server = self.create(true, endpoint);
        let server_ptr: ConnectionPtr = server.clone();
        let Some(protocol) = acceptor.accepted(server_ptr) else {
            tracing::debug!("connection to {endpoint} refused");
            client.disconnect();
            return Err(TransportError::ConnectionClosed(client.id));
        };
        server.set_protocol(Arc::downgrade(&protocol));

        server.pair(&client);
        client.pair(&server);
        tracing::debug!(
            client = client.id,
            server = server.id,
            "connected to {endpoint}"
        );
        Ok(())
    }

    fn bind(&self, endpoint: &str, acceptor: Arc<dyn Acceptor>) -> Result<(), TransportError> {
        if !endpoint.starts_with("mem://") {
            return Err(TransportError::InvalidEndpoint(endpoint.to_owned()));
        }
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(endpoint) {
            return Err(TransportError::AlreadyBound(endpoint.to_owned()));
        }
        listeners.insert(endpoint.to_owned(), acceptor);
        Ok(())
    }

    fn unbind(&self, endpoint: &str) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use entity_bus_core::{MessageFactory, MessagePtr, ProtocolCallback, ProtocolCapabilities};
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Connected,
        Data(Vec<u8>),
        Closed,
    }

    /// Protocol that reports raw transport events on a channel.
    struct Probe {
        events: UnboundedSender<Seen>,
        connection: Mutex<Option<ConnectionPtr>>,
    }

    impl Protocol for Probe {
        fn set_callback(&self, _callback: Weak<dyn ProtocolCallback>) {}

        fn set_connection(&self, connection: ConnectionPtr) {
            *self.connection.lock().unwrap() = Some(connection);
        }

        fn connection(&self) -> Option<ConnectionPtr> {
            self.connection.lock().unwrap().clone()
        }

        fn disconnect(&self) {}

        fn protocol_id(&self) -> u32 {
            0
        }

        fn capabilities(&self) -> ProtocolCapabilities {
            ProtocolCapabilities::default()
        }

        fn message_factory(&self) -> MessageFactory {
            Arc::new(|| entity_bus_core::ProtocolMessage::new(0))
        }

        fn send_message(&self, _message: MessagePtr) -> bool {
            false
        }

        fn connected(&self, _connection: &ConnectionPtr) {
            let _ = self.events.send(Seen::Connected);
        }

        fn disconnected(&self, _connection: &ConnectionPtr) {
            let _ = self.events.send(Seen::Closed);
        }

        fn received(&self, _connection: &ConnectionPtr, data: &[u8]) {
            let _ = self.events.send(Seen::Data(data.to_vec()));
        }
    }

    fn probe() -> (Arc<Probe>, mpsc::UnboundedReceiver<Seen>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let probe = Arc::new(Probe {
            events,
            connection: Mutex::new(None),
        });
        (probe, receiver)
    }

    struct ProbeAcceptor(Arc<Probe>);

    impl Acceptor for ProbeAcceptor {
        fn accepted(&self, connection: ConnectionPtr) -> Option<entity_bus_core::ProtocolPtr> {
            self.0.set_connection(connection);
            Some(self.0.clone())
        }
    }

    async fn next(receiver: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_bytes_sent_before_connect_arrive_after_connected() {
        let transport = MemoryTransport::current();
        let (server, mut server_events) = probe();
        transport
            .bind("mem://echo", Arc::new(ProbeAcceptor(server)))
            .unwrap();

        let (client, mut client_events) = probe();
        let client_protocol: Arc<dyn Protocol> = client.clone();
        let connection = transport.create_connection(Arc::downgrade(&client_protocol));
        assert!(connection.send(vec![Bytes::from_static(b"early")]));
        transport
            .connect("mem://echo", &connection, &ConnectProperties::new())
            .unwrap();

        assert_eq!(next(&mut server_events).await, Seen::Connected);
        assert_eq!(next(&mut server_events).await, Seen::Data(b"early".to_vec()));
        assert_eq!(next(&mut client_events).await, Seen::Connected);
        assert!(connection.is_connected());

        connection.send(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(next(&mut server_events).await, Seen::Data(b"ab".to_vec()));

        connection.disconnect();
        assert_eq!(next(&mut client_events).await, Seen::Closed);
        assert_eq!(next(&mut server_events).await, Seen::Closed);
        assert!(!connection.send(vec![Bytes::from_static(b"late")]));
    }

    #[tokio::test]
    async fn test_connect_without_listener() {
        let transport = MemoryTransport::current();
        let (client, _events) = probe();
        let client_protocol: Arc<dyn Protocol> = client;
        let connection = transport.create_connection(Arc::downgrade(&client_protocol));
        assert!(matches!(
            transport.connect("mem://nobody", &connection, &ConnectProperties::new()),
            Err(TransportError::NotListening(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_rules() {
        let transport = MemoryTransport::current();
        let (server, _events) = probe();
        let acceptor: Arc<dyn Acceptor> = Arc::new(ProbeAcceptor(server));
        transport.bind("mem://a", acceptor.clone()).unwrap();
        assert!(matches!(
            transport.bind("mem://a", acceptor.clone()),
            Err(TransportError::AlreadyBound(_))
        ));
        assert!(matches!(
            transport.bind("tcp://a", acceptor.clone()),
            Err(TransportError::InvalidEndpoint(_))
        ));
        transport.unbind("mem://a");
        transport.bind("mem://a", acceptor).unwrap();
    }
}
