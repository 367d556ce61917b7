//! Protocol session: one logical conversation over one or more connections.
//!
//! A session starts unbound, buffers what it is asked to send, and binds to
//! a protocol exactly once. After binding it routes outbound messages to the
//! right protocol instance:
//! - poll-driven protocols queue requests until the client polls
//! - request/reply protocols spread requests over a bounded connection pool
//! - multi-connection protocols pick the connection named in the echo data
//!
//! All routing state sits behind one mutex. Protocols never call back into
//! the session while it is held.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
        atomic::{AtomicI32, Ordering},
    },
};

use entity_bus_core::{
    BindProperties, ConnectProperties, ConnectionFactory, ConnectionId, ConnectionPtr, EchoData,
    ExecutorPtr, MessageFactory, MessagePtr, Protocol, ProtocolCallback, ProtocolCapabilities,
    ProtocolFactory, ProtocolMessage, ProtocolPtr, SessionId,
    executor::run_or_inline,
    message::{CONTROL_POLL_STOP, ECHO_CONNECTION_ID},
    properties::{ACTIVITY_TIMEOUT, POLL_MAX_REQUESTS},
};
use serde_json::Value;

use crate::{
    SessionError,
    list::SessionList,
    poll::PollState,
    pool::{Allocation, RequestPool},
    registry::ProtocolRegistry,
    timer::PollingTimer,
};

pub type SessionPtr = Arc<ProtocolSession>;

/// Session events, delivered on the session's executor when it has one.
pub trait SessionCallback: Send + Sync {
    fn connected(&self, session: &SessionPtr);

    fn disconnected(&self, session: &SessionPtr);

    fn disconnected_virtual_session(&self, session: &SessionPtr, virtual_session_id: &str);

    fn received(&self, session: &SessionPtr, message: MessagePtr);

    fn socket_connected(&self, session: &SessionPtr);

    fn socket_disconnected(&self, session: &SessionPtr);

    /// A pooled connection closed before the reply to this request arrived.
    fn request_connection_lost(&self, session: &SessionPtr, echo_data: EchoData);
}

/// Collaborators shared by every session of one manager.
#[derive(Clone)]
pub struct SessionEnv {
    pub callback: Weak<dyn SessionCallback>,
    pub executor: Option<ExecutorPtr>,
    pub list: Arc<SessionList>,
    pub protocols: Arc<ProtocolRegistry>,
    pub transport: Arc<dyn ConnectionFactory>,
}

/// Protocol values fixed when the session binds.
struct Binding {
    capabilities: ProtocolCapabilities,
    protocol_id: u32,
    message_factory: MessageFactory,
}

struct State {
    protocol: Option<ProtocolPtr>,
    connection_id: ConnectionId,
    multi_protocols: HashMap<ConnectionId, ProtocolPtr>,
    protocol_factory: Option<Arc<dyn ProtocolFactory>>,
    endpoint: String,
    connect_properties: ConnectProperties,
    incoming: bool,
    verified: bool,
    trigger_connected: bool,
    trigger_disconnected: bool,
    buffered: VecDeque<MessagePtr>,
    poll: PollState,
    pool: RequestPool,
    activity_timeout: i64,
    activity_timer: PollingTimer,
}

impl Default for State {
    fn default() -> Self {
        Self {
            protocol: None,
            connection_id: 0,
            multi_protocols: HashMap::new(),
            protocol_factory: None,
            endpoint: String::new(),
            connect_properties: ConnectProperties::default(),
            incoming: false,
            verified: false,
            trigger_connected: false,
            trigger_disconnected: false,
            buffered: VecDeque::new(),
            poll: PollState::default(),
            pool: RequestPool::default(),
            activity_timeout: -1,
            activity_timer: PollingTimer::new(),
        }
    }
}

impl State {
    fn protocol_for_connection(&self, connection_id: ConnectionId) -> Option<ProtocolPtr> {
        if connection_id != 0 && connection_id != self.connection_id {
            return self.multi_protocols.get(&connection_id).cloned();
        }
        self.protocol.clone()
    }

    fn all_protocols(&self) -> Vec<ProtocolPtr> {
        let mut protocols: Vec<ProtocolPtr> = self.protocol.iter().cloned().collect();
        for protocol in self.multi_protocols.values().cloned().chain(self.pool.protocols()) {
            if !protocols.iter().any(|p| Arc::ptr_eq(p, &protocol)) {
                protocols.push(protocol);
            }
        }
        protocols
    }
}

/// Follow-up work collected under the lock, run after it is released.
#[derive(Default)]
struct PoolWork {
    to_connect: Vec<ConnectionPtr>,
    lost: Vec<EchoData>,
}

/// Shared handle type for sessions is [`SessionPtr`].
pub struct ProtocolSession {
    this: Weak<Self>,
    session_id: SessionId,
    callback: Weak<dyn SessionCallback>,
    executor: Option<ExecutorPtr>,
    list: Weak<SessionList>,
    protocols: Arc<ProtocolRegistry>,
    transport: Arc<dyn ConnectionFactory>,
    content_type: AtomicI32,
    binding: OnceLock<Binding>,
    state: Mutex<State>,
}

/// Split `transport-endpoint:protocol` at the last colon.
///
/// # Errors
/// Returns error if either part is empty.
pub fn split_endpoint(endpoint: &str) -> Result<(&str, &str), SessionError> {
    match endpoint.rsplit_once(':') {
        Some((address, protocol)) if !address.is_empty() && !protocol.is_empty() => {
            Ok((address, protocol))
        }
        _ => Err(SessionError::InvalidEndpoint(endpoint.to_owned())),
    }
}

impl ProtocolSession {
    fn build(env: &SessionEnv, content_type: i32, state: State) -> SessionPtr {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            session_id: env.list.allocate_id(),
            callback: env.callback.clone(),
            executor: env.executor.clone(),
            list: Arc::downgrade(&env.list),
            protocols: env.protocols.clone(),
            transport: env.transport.clone(),
            content_type: AtomicI32::new(content_type),
            binding: OnceLock::new(),
            state: Mutex::new(state),
        })
    }

    /// Create an unbound session that will connect out.
    #[must_use]
    pub fn outgoing(env: &SessionEnv, content_type: i32) -> SessionPtr {
        let session = Self::build(
            env,
            content_type,
            State {
                verified: true,
                ..State::default()
            },
        );
        if let Err(e) = env.list.add(session.clone(), true) {
            tracing::error!("failed to register session: {e}");
        }
        session
    }

    /// Create a session for a connection accepted on a bound endpoint.
    ///
    /// The session joins the session list once [`Self::set_connection`] runs.
    #[must_use]
    pub fn incoming(
        env: &SessionEnv,
        protocol: ProtocolPtr,
        content_type: i32,
        properties: &BindProperties,
    ) -> SessionPtr {
        let data = &properties.protocol_data;
        let mut state = State {
            incoming: true,
            protocol: Some(protocol.clone()),
            ..State::default()
        };
        if let Some(timeout) = data.get_i64(ACTIVITY_TIMEOUT) {
            state.activity_timeout = timeout;
        }
        if let Some(max) = data.get_i64(POLL_MAX_REQUESTS) {
            state.poll.max_requests = max;
        }
        let session = Self::build(env, content_type, state);
        session.init_binding(&protocol);
        protocol.set_callback(session.protocol_callback());
        session
    }

    fn init_binding(&self, protocol: &ProtocolPtr) {
        let _ = self.binding.set(Binding {
            capabilities: protocol.capabilities(),
            protocol_id: protocol.protocol_id(),
            message_factory: protocol.message_factory(),
        });
    }

    fn protocol_callback(&self) -> Weak<dyn ProtocolCallback> {
        self.this.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: impl FnOnce(&dyn SessionCallback, &SessionPtr) + Send + 'static) {
        let (Some(callback), Some(session)) = (self.callback.upgrade(), self.this.upgrade())
        else {
            return;
        };
        run_or_inline(self.executor.as_ref(), move || {
            event(callback.as_ref(), &session);
        });
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn content_type(&self) -> i32 {
        self.content_type.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn executor(&self) -> Option<&ExecutorPtr> {
        self.executor.as_ref()
    }

    /// Capabilities of the bound protocol, all false while unbound.
    #[must_use]
    pub fn capabilities(&self) -> ProtocolCapabilities {
        self.binding
            .get()
            .map(|binding| binding.capabilities)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    #[must_use]
    pub fn is_incoming(&self) -> bool {
        self.lock_state().incoming
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        self.lock_state().endpoint.clone()
    }

    /// Empty message for the bound protocol.
    #[must_use]
    pub fn create_message(&self) -> ProtocolMessage {
        self.binding
            .get()
            .map_or_else(ProtocolMessage::default, |binding| {
                (binding.message_factory)()
            })
    }

    /// Messages waiting for a binding or a free pooled connection.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.lock_state().buffered.len()
    }

    /// Requests waiting for the client to poll.
    #[must_use]
    pub fn poll_queue_len(&self) -> usize {
        self.lock_state().poll.messages.len()
    }

    #[must_use]
    pub fn pooled_connection_count(&self) -> usize {
        self.lock_state().pool.len()
    }

    #[must_use]
    pub fn in_flight_requests(&self) -> usize {
        self.lock_state().pool.in_flight()
    }

    /// Bind to the protocol named in `endpoint` and connect.
    ///
    /// Messages buffered while unbound are flushed in order.
    ///
    /// # Errors
    /// Returns error if the endpoint is malformed, the protocol is unknown,
    /// the session is already bound or the transport refuses to connect.
    pub fn connect(&self, endpoint: &str, properties: &ConnectProperties) -> Result<(), SessionError> {
        let (address, protocol_name) = split_endpoint(endpoint)?;
        let factory = self
            .protocols
            .get(protocol_name)
            .ok_or_else(|| SessionError::UnknownProtocol(protocol_name.to_owned()))?;
        let protocol = factory.create_protocol(&properties.protocol_data);

        let mut work = PoolWork::default();
        {
            let mut st = self.lock_state();
            if st.protocol.is_some() {
                return Err(SessionError::AlreadyBound);
            }
            self.init_binding(&protocol);
            address.clone_into(&mut st.endpoint);
            st.connect_properties = properties.clone();
            st.protocol_factory = Some(factory);
            st.verified = true;

            protocol.set_callback(self.protocol_callback());
            let connection = self.transport.create_connection(Arc::downgrade(&protocol));
            protocol.set_connection(connection.clone());
            st.connection_id = connection.connection_id();
            st.protocol = Some(protocol.clone());
            work.to_connect.push(connection.clone());

            if self.capabilities().synchronous_request_reply {
                st.pool
                    .set_max(properties.protocol_data.max_request_connections());
                st.multi_protocols
                    .insert(connection.connection_id(), protocol.clone());
                st.pool.insert(protocol, connection, None);
                self.drain_pool(&mut st, &mut work);
            } else {
                self.send_buffered(&mut st);
            }
        }
        if let Some(list) = self.list.upgrade() {
            list.set_verified(self.session_id, true);
        }
        tracing::debug!(session = self.session_id, "connecting to {address}");
        self.finish_pool_work(work)
    }

    /// Attach the connection an incoming session was accepted on.
    pub fn set_connection(&self, connection: ConnectionPtr, verified: bool) {
        let protocol = {
            let mut st = self.lock_state();
            st.connection_id = connection.connection_id();
            st.incoming = connection.is_incoming();
            st.verified = verified;
            if st.incoming {
                let timeout = st.activity_timeout;
                st.activity_timer.set_timeout(timeout);
            }
            st.protocol.clone()
        };
        if let Some(protocol) = protocol {
            protocol.set_connection(connection);
        }
        if let (Some(list), Some(session)) = (self.list.upgrade(), self.this.upgrade()) {
            if let Err(e) = list.add(session, verified) {
                tracing::error!("failed to register session: {e}");
            }
        }
    }

    /// Replace the protocol, for example when a client rejoins a named session.
    pub fn set_protocol(&self, protocol: ProtocolPtr) {
        self.init_binding(&protocol);
        protocol.set_callback(self.protocol_callback());
        let multi = self.capabilities().multi_connection_session;

        let mut st = self.lock_state();
        if multi && st.protocol.is_some() {
            if let Some(connection) = protocol.connection() {
                st.multi_protocols.retain(|_, p| {
                    p.connection().is_some_and(|c| c.is_connected())
                });
                st.multi_protocols
                    .insert(connection.connection_id(), protocol);
            }
            return;
        }
        if let Some(old) = st.protocol.replace(protocol.clone()) {
            protocol.move_old_protocol_state(old.as_ref());
        }
        if let Some(connection) = protocol.connection() {
            st.connection_id = connection.connection_id();
        }
        self.send_buffered(&mut st);
    }

    /// Send a message, or queue it until it can be sent.
    ///
    /// Returns false when the bound protocol refused the message.
    pub fn send_message(&self, message: MessagePtr, is_reply: bool) -> bool {
        let caps = self.capabilities();
        let mut st = self.lock_state();

        if !is_reply && caps.send_request_by_poll {
            self.queue_for_poll(&mut st, message);
            if st.poll.over_limit() {
                drop(st);
                tracing::warn!(
                    session = self.session_id,
                    "too many requests waiting for poll, disconnecting"
                );
                self.disconnect();
            }
            return true;
        }

        let Some(main) = st.protocol.clone() else {
            st.buffered.push_back(message);
            return true;
        };

        if caps.synchronous_request_reply && !is_reply {
            st.buffered.push_back(message);
            let mut work = PoolWork::default();
            self.drain_pool(&mut st, &mut work);
            drop(st);
            if let Err(e) = self.finish_pool_work(work) {
                tracing::error!(session = self.session_id, "pooled connect failed: {e}");
            }
            return true;
        }

        let protocol = if caps.multi_connection_session {
            let connection_id = message
                .echo_data()
                .get(ECHO_CONNECTION_ID)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            st.protocol_for_connection(connection_id)
        } else {
            Some(main)
        };
        protocol.is_some_and(|protocol| self.send_with(&message, &protocol))
    }

    fn queue_for_poll(&self, st: &mut State, message: MessagePtr) {
        if !st.poll.waiting {
            st.poll.messages.push_back(message);
            return;
        }
        let Some(protocol) = st.protocol_for_connection(st.poll.connection_id) else {
            st.poll.clear_slot();
            st.poll.messages.push_back(message);
            return;
        };
        st.poll.counter += 1;
        let reply = Arc::new(protocol.poll_reply(std::slice::from_ref(&message)));
        if !self.send_with(&reply, &protocol) {
            st.poll.reply = Some(reply);
        }
        if st.poll.count_reached() {
            self.poll_release(st);
        }
    }

    /// End the waiting poll with an empty reply marked as poll stop.
    fn poll_release(&self, st: &mut State) {
        if !st.poll.waiting {
            return;
        }
        if let Some(protocol) = st.protocol_for_connection(st.poll.connection_id) {
            let mut reply = protocol.poll_reply(&[]);
            reply
                .control_data_mut()
                .insert(CONTROL_POLL_STOP.into(), Value::Bool(true));
            self.send_with(&Arc::new(reply), &protocol);
        }
        st.poll.clear_slot();
    }

    /// Release the poll slot, if one is held.
    pub fn release_poll(&self) {
        let mut st = self.lock_state();
        self.poll_release(&mut st);
    }

    /// Hand buffered requests to idle or new pooled connections, oldest first.
    fn drain_pool(&self, st: &mut State, work: &mut PoolWork) {
        while let Some(message) = st.buffered.front().cloned() {
            match st.pool.allocate() {
                Allocation::Reuse(id, protocol) => {
                    st.buffered.pop_front();
                    st.pool.occupy(id, message.echo_data().clone());
                    if !self.send_with(&message, &protocol) {
                        tracing::warn!(session = self.session_id, "pooled connection {id} refused request");
                        if let Some((_, Some(echo))) = st.pool.remove(id) {
                            work.lost.push(echo);
                        }
                        st.multi_protocols.remove(&id);
                    }
                }
                Allocation::Create => {
                    let Some(factory) = st.protocol_factory.clone() else {
                        break;
                    };
                    st.buffered.pop_front();
                    let protocol = factory.create_protocol(&st.connect_properties.protocol_data);
                    protocol.set_callback(self.protocol_callback());
                    let connection = self.transport.create_connection(Arc::downgrade(&protocol));
                    protocol.set_connection(connection.clone());
                    st.multi_protocols
                        .insert(connection.connection_id(), protocol.clone());
                    st.pool.insert(
                        protocol.clone(),
                        connection.clone(),
                        Some(message.echo_data().clone()),
                    );
                    self.send_with(&message, &protocol);
                    work.to_connect.push(connection);
                }
                Allocation::Exhausted => break,
            }
        }
    }

    fn finish_pool_work(&self, work: PoolWork) -> Result<(), SessionError> {
        let (endpoint, properties) = {
            let st = self.lock_state();
            (st.endpoint.clone(), st.connect_properties.clone())
        };
        for echo in work.lost {
            self.notify(move |callback, session| callback.request_connection_lost(session, echo));
        }
        for connection in work.to_connect {
            self.transport.connect(&endpoint, &connection, &properties)?;
        }
        Ok(())
    }

    fn send_buffered(&self, st: &mut State) {
        let Some(protocol) = st.protocol.clone() else {
            return;
        };
        while let Some(message) = st.buffered.pop_front() {
            self.send_with(&message, &protocol);
        }
    }

    fn send_with(&self, message: &MessagePtr, protocol: &ProtocolPtr) -> bool {
        let converted = self.convert_message_to_protocol(message);
        let ok = protocol.send_message(converted);
        if ok {
            message.mark_sent();
        }
        ok
    }

    /// Re-frame a message built for another protocol.
    ///
    /// A copy is made when the protocol differs, when a non-resendable
    /// message was already sent, or when only a receive payload exists.
    /// Copies for resendable protocols are cached on the source message.
    fn convert_message_to_protocol(&self, message: &MessagePtr) -> MessagePtr {
        let Some(binding) = self.binding.get() else {
            return message.clone();
        };
        let resendable = binding.capabilities.messages_resendable;
        let needs_copy = message.protocol_id() != binding.protocol_id
            || (!resendable && message.was_sent())
            || (message.total_send_payload_size() == 0 && !message.receive_payload().is_empty());
        if !needs_copy {
            return message.clone();
        }
        if resendable {
            if let Some(cached) = message.cached_conversion(binding.protocol_id) {
                return cached;
            }
        }

        let mut converted = (binding.message_factory)();
        converted.metainfo_mut().clone_from(message.metainfo());
        converted.control_data_mut().clone_from(message.control_data());
        converted.echo_data_mut().clone_from(message.echo_data());
        if message.total_send_payload_size() > 0 {
            converted.add_send_payload(message.joined_send_payload());
        } else {
            converted.add_send_payload(message.receive_payload().clone());
        }
        let converted = Arc::new(converted);
        if resendable {
            message.cache_conversion(converted.clone());
        }
        converted
    }

    /// Close every connection of the session.
    pub fn disconnect(&self) {
        let (protocols, lost) = {
            let mut st = self.lock_state();
            self.poll_release(&mut st);
            let protocols = st.all_protocols();
            st.multi_protocols.clear();
            (protocols, st.pool.clear())
        };
        for protocol in protocols {
            protocol.disconnect();
        }
        for echo in lost {
            self.notify(move |callback, session| callback.request_connection_lost(session, echo));
        }
        ProtocolCallback::disconnected(self);
    }

    pub fn subscribe(&self, subscriptions: &[String]) {
        let protocol = self.lock_state().protocol.clone();
        if let Some(protocol) = protocol {
            protocol.subscribe(subscriptions);
        }
    }

    /// Periodic tick: expire the poll and activity timers, then tick protocols.
    pub fn cycle_time(&self) {
        let (protocols, idle) = {
            let mut st = self.lock_state();
            if st.poll.timer.is_expired() {
                self.poll_release(&mut st);
            }
            (st.all_protocols(), st.activity_timer.is_expired())
        };
        if idle {
            tracing::debug!(session = self.session_id, "activity timeout, disconnecting");
            self.disconnect();
        }
        for protocol in protocols {
            protocol.cycle_time();
        }
    }
}

impl ProtocolCallback for ProtocolSession {
    fn connected(&self) {
        let fire = {
            let mut st = self.lock_state();
            !std::mem::replace(&mut st.trigger_connected, true)
        };
        if fire {
            tracing::debug!(session = self.session_id, "session connected");
            self.notify(|callback, session| callback.connected(session));
        }
    }

    fn disconnected(&self) {
        let fire = {
            let mut st = self.lock_state();
            self.poll_release(&mut st);
            let first = !std::mem::replace(&mut st.trigger_disconnected, true);
            first && (st.trigger_connected || !st.endpoint.is_empty() || st.incoming)
        };
        if let Some(list) = self.list.upgrade() {
            list.remove(self.session_id);
        }
        if fire {
            tracing::debug!(session = self.session_id, "session disconnected");
            self.notify(|callback, session| callback.disconnected(session));
        }
    }

    fn disconnected_virtual_session(&self, virtual_session_id: &str) {
        let virtual_session_id = virtual_session_id.to_owned();
        self.notify(move |callback, session| {
            callback.disconnected_virtual_session(session, &virtual_session_id);
        });
    }

    fn received(&self, mut message: ProtocolMessage, connection_id: ConnectionId) {
        self.activity();
        let caps = self.capabilities();
        let mut work = PoolWork::default();
        {
            let mut st = self.lock_state();
            if caps.multi_connection_session
                && connection_id != 0
                && connection_id != st.connection_id
            {
                message
                    .echo_data_mut()
                    .insert(ECHO_CONNECTION_ID.into(), Value::from(connection_id));
            }
            if caps.synchronous_request_reply {
                if let Some(echo) = st.pool.release(connection_id) {
                    message.echo_data_mut().extend(echo);
                }
                self.drain_pool(&mut st, &mut work);
            }
        }
        if let Err(e) = self.finish_pool_work(work) {
            tracing::error!(session = self.session_id, "pooled connect failed: {e}");
        }
        let message = Arc::new(message);
        self.notify(move |callback, session| callback.received(session, message));
    }

    fn socket_connected(&self) {
        self.notify(|callback, session| callback.socket_connected(session));
    }

    fn socket_disconnected(&self) {
        self.notify(|callback, session| callback.socket_disconnected(session));
    }

    fn reconnect(&self) {
        let (protocol, endpoint, properties) = {
            let st = self.lock_state();
            (st.protocol.clone(), st.endpoint.clone(), st.connect_properties.clone())
        };
        let Some(protocol) = protocol else {
            return;
        };
        if endpoint.is_empty() {
            return;
        }
        let connection = self.transport.create_connection(Arc::downgrade(&protocol));
        protocol.set_connection(connection.clone());
        self.lock_state().connection_id = connection.connection_id();
        if let Err(e) = self.transport.connect(&endpoint, &connection, &properties) {
            tracing::error!(session = self.session_id, "reconnect to {endpoint} failed: {e}");
        }
    }

    fn find_session_by_name(&self, name: &str, protocol: &ProtocolPtr) -> bool {
        let Some(list) = self.list.upgrade() else {
            return false;
        };
        let Some(found) = list.find_by_name(name) else {
            return false;
        };
        if found.session_id == self.session_id {
            return true;
        }
        found.set_protocol(protocol.clone());
        list.remove(self.session_id);
        true
    }

    fn set_session_name(&self, name: &str, protocol: &ProtocolPtr, connection: &ConnectionPtr) {
        if let Some(list) = self.list.upgrade() {
            list.set_session_name(self.session_id, name);
        }
        let mut st = self.lock_state();
        if st.protocol.is_none() {
            st.protocol = Some(protocol.clone());
            st.connection_id = connection.connection_id();
        }
    }

    fn poll_request(&self, connection_id: ConnectionId, timeout_ms: i64, poll_count_max: i64) {
        self.activity();
        let mut st = self.lock_state();
        self.poll_release(&mut st);
        st.poll.counter = 0;
        st.poll.count_max = poll_count_max;

        if let Some(protocol) = st.protocol_for_connection(connection_id) {
            if let Some(reply) = st.poll.reply.take() {
                st.poll.counter += 1;
                if !self.send_with(&reply, &protocol) {
                    st.poll.reply = Some(reply);
                }
            } else if !st.poll.messages.is_empty() {
                let messages: Vec<MessagePtr> = st.poll.messages.drain(..).collect();
                st.poll.counter += 1;
                let reply = Arc::new(protocol.poll_reply(&messages));
                if !self.send_with(&reply, &protocol) {
                    st.poll.reply = Some(reply);
                }
            }
        }

        st.poll.waiting = true;
        st.poll.connection_id = connection_id;
        if timeout_ms > 0 {
            st.poll.timer.set_timeout(timeout_ms);
        }
        if timeout_ms == 0 || st.poll.count_reached() {
            self.poll_release(&mut st);
        }
    }

    fn activity(&self) {
        let mut st = self.lock_state();
        if st.incoming {
            let timeout = st.activity_timeout;
            st.activity_timer.set_timeout(timeout);
        }
    }

    fn set_activity_timeout(&self, timeout_ms: i64) {
        let mut st = self.lock_state();
        st.activity_timeout = timeout_ms;
        if st.incoming {
            st.activity_timer.set_timeout(timeout_ms);
        }
    }

    fn set_poll_max_requests(&self, max_requests: i64) {
        self.lock_state().poll.max_requests = max_requests;
    }

    fn disconnected_multi_connection(&self, connection_id: ConnectionId) {
        let mut work = PoolWork::default();
        let verified = {
            let mut st = self.lock_state();
            if st.poll.waiting && st.poll.connection_id == connection_id {
                st.poll.clear_slot();
            }
            st.multi_protocols.remove(&connection_id);
            if let Some((_, Some(echo))) = st.pool.remove(connection_id) {
                work.lost.push(echo);
            }
            self.drain_pool(&mut st, &mut work);
            st.verified
        };
        if let Err(e) = self.finish_pool_work(work) {
            tracing::error!(session = self.session_id, "pooled connect failed: {e}");
        }
        if !verified {
            ProtocolCallback::disconnected(self);
        }
    }

    fn connection_lost(&self, connection_id: ConnectionId) {
        let outstanding = self.lock_state().pool.mark_dead(connection_id);
        if outstanding {
            tracing::debug!(
                session = self.session_id,
                "connection {connection_id} died with a request in flight"
            );
        }
    }
}
