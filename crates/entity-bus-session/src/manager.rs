//! Session manager: binds endpoints and creates sessions.

use std::sync::{Arc, Weak};

use entity_bus_core::{
    Acceptor, BindProperties, ConnectProperties, ConnectionFactory, ConnectionPtr, ExecutorPtr,
    ProtocolFactory, ProtocolPtr, SessionId,
};

use crate::{
    SessionError,
    list::SessionList,
    registry::ProtocolRegistry,
    session::{ProtocolSession, SessionCallback, SessionEnv, SessionPtr, split_endpoint},
};

/// Creates a session for every connection accepted on a bound endpoint.
struct BindAcceptor {
    env: SessionEnv,
    factory: Arc<dyn ProtocolFactory>,
    properties: BindProperties,
    content_type: i32,
}

impl Acceptor for BindAcceptor {
    fn accepted(&self, connection: ConnectionPtr) -> Option<ProtocolPtr> {
        let protocol = self.factory.create_protocol(&self.properties.protocol_data);
        let session = ProtocolSession::incoming(
            &self.env,
            protocol.clone(),
            self.content_type,
            &self.properties,
        );
        let verified = !protocol.capabilities().supports_session;
        tracing::debug!(
            session = session.session_id(),
            "accepted connection {}",
            connection.connection_id()
        );
        session.set_connection(connection, verified);
        Some(protocol)
    }
}

/// Session manager for one container.
pub struct SessionManager {
    env: SessionEnv,
}

impl SessionManager {
    /// Create a session manager.
    #[must_use]
    pub fn new(
        callback: Weak<dyn SessionCallback>,
        transport: Arc<dyn ConnectionFactory>,
        protocols: Arc<ProtocolRegistry>,
        executor: Option<ExecutorPtr>,
    ) -> Self {
        Self {
            env: SessionEnv {
                callback,
                executor,
                list: Arc::new(SessionList::new()),
                protocols,
                transport,
            },
        }
    }

    #[must_use]
    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.env.protocols
    }

    #[must_use]
    pub fn executor(&self) -> Option<&ExecutorPtr> {
        self.env.executor.as_ref()
    }

    /// Listen on `transport-endpoint:protocol`.
    ///
    /// # Errors
    /// Returns error if the endpoint is malformed, the protocol is unknown or
    /// the transport cannot bind.
    pub fn bind(
        &self,
        endpoint: &str,
        properties: &BindProperties,
        content_type: i32,
    ) -> Result<(), SessionError> {
        let (address, protocol_name) = split_endpoint(endpoint)?;
        let factory = self
            .env
            .protocols
            .get(protocol_name)
            .ok_or_else(|| SessionError::UnknownProtocol(protocol_name.to_owned()))?;
        let acceptor = Arc::new(BindAcceptor {
            env: self.env.clone(),
            factory,
            properties: properties.clone(),
            content_type,
        });
        self.env.transport.bind(address, acceptor)?;
        tracing::info!("listening on {endpoint}");
        Ok(())
    }

    /// Stop listening on an endpoint passed to [`Self::bind`].
    pub fn unbind(&self, endpoint: &str) {
        if let Ok((address, _)) = split_endpoint(endpoint) {
            self.env.transport.unbind(address);
        }
    }

    /// Create an unbound outgoing session. It buffers until connected.
    #[must_use]
    pub fn create_session(&self, content_type: i32) -> SessionPtr {
        ProtocolSession::outgoing(&self.env, content_type)
    }

    /// Create a session and connect it to `transport-endpoint:protocol`.
    ///
    /// # Errors
    /// Returns error if the session cannot bind or connect.
    pub fn connect(
        &self,
        endpoint: &str,
        properties: &ConnectProperties,
        content_type: i32,
    ) -> Result<SessionPtr, SessionError> {
        let session = self.create_session(content_type);
        if let Err(e) = session.connect(endpoint, properties) {
            self.env.list.remove(session.session_id());
            return Err(e);
        }
        Ok(session)
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<SessionPtr> {
        self.env.list.get(id)
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionPtr> {
        self.env.list.all()
    }

    /// Tick every live session.
    pub fn cycle_time(&self) {
        for session in self.env.list.all() {
            session.cycle_time();
        }
    }

    /// Disconnect every live session.
    pub fn disconnect_all(&self) {
        for session in self.env.list.all() {
            session.disconnect();
        }
    }
}
