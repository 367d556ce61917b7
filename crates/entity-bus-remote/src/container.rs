//! Entity container: owns the sessions and routes inbound messages to entities.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
    time::Duration,
};

use entity_bus_core::{
    BindProperties, ConnectProperties, ConnectionEvent, ConnectionFactory, ENTITYID_DEFAULT,
    ENTITYID_INVALID, EchoData, EntityId, EventHub, ExecutorPtr, Header, MessagePtr, Metainfo,
    MsgMode, SessionId, Status,
    message::{ECHO_CORRELATION_ID, ECHO_SOURCE_ID},
};
use entity_bus_session::{ProtocolRegistry, SessionCallback, SessionError, SessionManager, SessionPtr};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    entity::RemoteEntity,
    format::{FormatRegistry, Outgoing, ParsedMessage},
    request_context::ReceiveData,
};

/// Container error.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Unknown content type: {0}")]
    UnknownContentType(String),
    #[error("Entity name already registered: {0}")]
    DuplicateName(String),
    #[error("Entity already registered with id {0}")]
    AlreadyRegistered(EntityId),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Container settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Interval of the session timer tick, in milliseconds.
    pub cycle_time: u64,
    /// Keep the undecoded payload of every request for its handler.
    pub store_raw_data: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cycle_time: 100,
            store_raw_data: false,
        }
    }
}

/// Application callback for session lifecycle events.
pub type ConnectionEventFn = Arc<dyn Fn(&SessionPtr, ConnectionEvent) + Send + Sync>;

/// A session event as published on the event hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionNotification {
    pub session_id: SessionId,
    pub event: ConnectionEvent,
}

#[derive(Default)]
struct EntityTable {
    by_id: HashMap<EntityId, Arc<RemoteEntity>>,
    by_name: HashMap<String, EntityId>,
    next_entity_id: EntityId,
}

/// Split `transport-endpoint:protocol:content-type` at the last colon.
fn split_content_type(endpoint: &str) -> Result<(&str, &str), ContainerError> {
    endpoint
        .rsplit_once(':')
        .filter(|(rest, name)| !rest.is_empty() && !name.is_empty())
        .ok_or_else(|| ContainerError::InvalidEndpoint(endpoint.to_owned()))
}

/// Fill in the address of a reply whose protocol could not carry it.
fn recover_reply_address(header: &mut Header, echo_data: &EchoData) {
    if header.corrid == 0 {
        if let Some(corrid) = echo_data.get(ECHO_CORRELATION_ID).and_then(Value::as_u64) {
            header.corrid = corrid;
        }
    }
    if header.destid == ENTITYID_DEFAULT || header.destid == ENTITYID_INVALID {
        if let Some(destid) = echo_data.get(ECHO_SOURCE_ID).and_then(Value::as_u64) {
            header.destid = destid;
        }
    }
}

pub struct RemoteEntityContainer {
    this: Weak<Self>,
    sessions: SessionManager,
    formats: Arc<FormatRegistry>,
    config: ContainerConfig,
    entities: RwLock<EntityTable>,
    connection_event: RwLock<Option<ConnectionEventFn>>,
    events: EventHub<ConnectionNotification>,
    cycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteEntityContainer {
    /// Create a container. Session callbacks run on `executor` when given,
    /// inline on transport tasks otherwise.
    #[must_use]
    pub fn new(
        transport: Arc<dyn ConnectionFactory>,
        protocols: Arc<ProtocolRegistry>,
        executor: Option<ExecutorPtr>,
        config: ContainerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let callback: Weak<dyn SessionCallback> = this.clone();
            Self {
                this: this.clone(),
                sessions: SessionManager::new(callback, transport, protocols, executor),
                formats: Arc::new(FormatRegistry::new()),
                config,
                entities: RwLock::new(EntityTable {
                    next_entity_id: 1,
                    ..EntityTable::default()
                }),
                connection_event: RwLock::new(None),
                events: EventHub::new(),
                cycle_task: Mutex::new(None),
            }
        })
    }

    #[must_use]
    pub const fn formats(&self) -> &Arc<FormatRegistry> {
        &self.formats
    }

    #[must_use]
    pub const fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn content_type<'a>(&self, endpoint: &'a str) -> Result<(&'a str, i32), ContainerError> {
        let (address, name) = split_content_type(endpoint)?;
        let content_type = self
            .formats
            .content_type_by_name(name)
            .ok_or_else(|| ContainerError::UnknownContentType(name.to_owned()))?;
        Ok((address, content_type))
    }

    /// Listen on `transport-endpoint:protocol:content-type`.
    ///
    /// # Errors
    /// Returns error if the content type or protocol is unknown or the
    /// transport cannot bind.
    pub fn bind(&self, endpoint: &str, properties: &BindProperties) -> Result<(), ContainerError> {
        let (address, content_type) = self.content_type(endpoint)?;
        self.sessions.bind(address, properties, content_type)?;
        Ok(())
    }

    pub fn unbind(&self, endpoint: &str) {
        if let Ok((address, _)) = split_content_type(endpoint) {
            self.sessions.unbind(address);
        }
    }

    /// Open a session to `transport-endpoint:protocol:content-type`.
    ///
    /// # Errors
    /// Returns error if the content type or protocol is unknown or the
    /// connect fails.
    pub fn connect(
        &self,
        endpoint: &str,
        properties: &ConnectProperties,
    ) -> Result<SessionPtr, ContainerError> {
        let (address, content_type) = self.content_type(endpoint)?;
        Ok(self.sessions.connect(address, properties, content_type)?)
    }

    // Entities

    /// Register `entity` under `name` and assign its id. An empty name
    /// registers an entity reachable by id only.
    ///
    /// # Errors
    /// Returns error if the entity is already registered or the name is taken.
    pub fn register_entity(
        &self,
        entity: &Arc<RemoteEntity>,
        name: &str,
    ) -> Result<EntityId, ContainerError> {
        if entity.is_registered() {
            return Err(ContainerError::AlreadyRegistered(entity.entity_id()));
        }
        let entity_id = {
            let mut table = self
                .entities
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !name.is_empty() && table.by_name.contains_key(name) {
                return Err(ContainerError::DuplicateName(name.to_owned()));
            }
            let entity_id = table.next_entity_id;
            table.next_entity_id += 1;
            table.by_id.insert(entity_id, entity.clone());
            if !name.is_empty() {
                table.by_name.insert(name.to_owned(), entity_id);
            }
            entity_id
        };
        entity.attach(entity_id, name, self.formats.clone());
        tracing::debug!(entity = entity_id, name, "entity registered");
        Ok(entity_id)
    }

    /// Remove an entity. Its peers are dropped and their requests failed.
    pub fn unregister_entity(&self, entity_id: EntityId) {
        let entity = {
            let mut table = self
                .entities
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            table.by_name.retain(|_, id| *id != entity_id);
            table.by_id.remove(&entity_id)
        };
        if let Some(entity) = entity {
            entity.deinit();
            entity.detach();
            tracing::debug!(entity = entity_id, "entity unregistered");
        }
    }

    #[must_use]
    pub fn entity(&self, entity_id: EntityId) -> Option<Arc<RemoteEntity>> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&entity_id)
            .cloned()
    }

    #[must_use]
    pub fn entity_id(&self, name: &str) -> Option<EntityId> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .copied()
    }

    #[must_use]
    pub fn entity_name(&self, entity_id: EntityId) -> Option<String> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .iter()
            .find(|(_, id)| **id == entity_id)
            .map(|(name, _)| name.clone())
    }

    #[must_use]
    pub fn all_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn entities_snapshot(&self) -> Vec<Arc<RemoteEntity>> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .values()
            .cloned()
            .collect()
    }

    /// Destination of a message: the id, or the name when the id is not set.
    fn resolve_destination(&self, header: &Header) -> (EntityId, Option<Arc<RemoteEntity>>) {
        let table = self
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut entity_id = header.destid;
        if entity_id == ENTITYID_INVALID
            || (entity_id == ENTITYID_DEFAULT && !header.destname.is_empty())
        {
            if let Some(id) = table.by_name.get(&header.destname) {
                entity_id = *id;
            }
        }
        (entity_id, table.by_id.get(&entity_id).cloned())
    }

    // Connection events

    pub fn register_connection_event(&self, callback: ConnectionEventFn) {
        match self.connection_event.write() {
            Ok(mut slot) => *slot = Some(callback),
            Err(e) => tracing::error!("connection event slot poisoned: {e}"),
        }
    }

    /// Session events, starting with the recorded history.
    #[must_use]
    pub fn connection_events(&self) -> BoxStream<'static, ConnectionNotification> {
        self.events.history_plus_stream()
    }

    fn fire_connection_event(&self, session: &SessionPtr, event: ConnectionEvent) {
        tracing::debug!(session = session.session_id(), ?event, "connection event");
        self.events.push(ConnectionNotification {
            session_id: session.session_id(),
            event,
        });
        let callback = self.connection_event.read().ok().and_then(|slot| slot.clone());
        if let Some(callback) = callback {
            callback(session, event);
        }
    }

    // Timer

    /// Tick every session once.
    pub fn cycle_time(&self) {
        self.sessions.cycle_time();
    }

    /// Tick every session each `cycle_time` milliseconds until the container
    /// is dropped.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn start_cycle_timer(&self) {
        let this = self.this.clone();
        let period = Duration::from_millis(self.config.cycle_time.max(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(container) = this.upgrade() else {
                    break;
                };
                container.cycle_time();
            }
        });
        let previous = self
            .cycle_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the timer and tear down every entity.
    pub fn deinit(&self) {
        if let Some(task) = self
            .cycle_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let entities: Vec<Arc<RemoteEntity>> = {
            let mut table = self
                .entities
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            table.by_name.clear();
            table.by_id.drain().map(|(_, entity)| entity).collect()
        };
        for entity in entities {
            entity.deinit();
            entity.detach();
        }
    }

    // Inbound routing

    fn reply_error(
        &self,
        session: &SessionPtr,
        parsed: ParsedMessage,
        entity_id: EntityId,
        status: Status,
    ) {
        tracing::debug!(
            session = session.session_id(),
            %status,
            path = %parsed.header.path,
            "request rejected"
        );
        let header = Header::reply(parsed.header.srcid, entity_id, status, "", parsed.header.corrid);
        let outgoing = Outgoing {
            virtual_session_id: &parsed.virtual_session_id,
            echo_data: parsed.echo_data,
            ..Outgoing::new(header, None)
        };
        if let Err(e) = self.formats.send(session, outgoing) {
            tracing::error!("failed to send error reply: {e}");
        }
    }

    /// Decode a body sent without type, using the type of the command at its path.
    fn body_for_command(
        &self,
        entity: &RemoteEntity,
        session: &SessionPtr,
        message: &MessagePtr,
        parsed: &mut ParsedMessage,
    ) {
        let Some(type_name) = entity.command_type(&parsed.header.path) else {
            return;
        };
        match self.formats.parse_body(session, message, &type_name) {
            Ok(body) => {
                parsed.body = body;
                parsed.header.type_name = type_name;
            }
            Err(e) => {
                tracing::debug!("body does not parse as {type_name}: {e}");
                parsed.status.syntax_error = true;
            }
        }
    }

    fn received_request(
        &self,
        session: &SessionPtr,
        message: &MessagePtr,
        mut parsed: ParsedMessage,
    ) {
        let (entity_id, entity) = self.resolve_destination(&parsed.header);
        if parsed.status.syntax_error {
            self.reply_error(session, parsed, entity_id, Status::SyntaxError);
            return;
        }
        let Some(entity) = entity else {
            self.reply_error(session, parsed, entity_id, Status::EntityNotFound);
            return;
        };
        if parsed.body.is_none()
            && parsed.header.type_name.is_empty()
            && session.capabilities().supports_metainfo
        {
            self.body_for_command(&entity, session, message, &mut parsed);
            if parsed.status.syntax_error {
                self.reply_error(session, parsed, entity_id, Status::SyntaxError);
                return;
            }
        }
        if parsed.body.is_none() {
            self.reply_error(session, parsed, entity_id, Status::RequestTypeNotKnown);
            return;
        }

        let automatic_connect = parsed.status.automatic_connect;
        let mut data = ReceiveData::new(session.clone(), parsed);
        if self.config.store_raw_data {
            data.raw_data = Some(if message.receive_payload().is_empty() {
                message.joined_send_payload()
            } else {
                message.receive_payload().clone()
            });
        }
        entity.received_request(data, automatic_connect);
    }

    fn received_reply(&self, session: &SessionPtr, mut parsed: ParsedMessage) {
        recover_reply_address(&mut parsed.header, &parsed.echo_data);
        let (entity_id, entity) = self.resolve_destination(&parsed.header);
        let Some(entity) = entity else {
            tracing::debug!(entity = entity_id, "reply for unknown entity dropped");
            return;
        };
        if parsed.body.is_none()
            && parsed.header.status == Status::Ok
            && !parsed.header.type_name.is_empty()
        {
            parsed.header.status = Status::ReplyTypeNotKnown;
        }
        entity.received_reply(ReceiveData::new(session.clone(), parsed));
    }
}

impl SessionCallback for RemoteEntityContainer {
    fn connected(&self, session: &SessionPtr) {
        self.fire_connection_event(session, ConnectionEvent::Connected);
    }

    fn disconnected(&self, session: &SessionPtr) {
        self.fire_connection_event(session, ConnectionEvent::Disconnected);
        for entity in self.entities_snapshot() {
            entity.session_disconnected(session);
        }
    }

    fn disconnected_virtual_session(&self, session: &SessionPtr, virtual_session_id: &str) {
        for entity in self.entities_snapshot() {
            entity.virtual_session_disconnected(session, virtual_session_id);
        }
    }

    fn received(&self, session: &SessionPtr, message: MessagePtr) {
        let parsed = self.formats.parse(session, &message);
        match parsed.header.mode {
            MsgMode::Request => self.received_request(session, &message, parsed),
            MsgMode::Reply => self.received_reply(session, parsed),
        }
    }

    fn socket_connected(&self, session: &SessionPtr) {
        self.fire_connection_event(session, ConnectionEvent::SocketConnected);
    }

    fn socket_disconnected(&self, session: &SessionPtr) {
        self.fire_connection_event(session, ConnectionEvent::SocketDisconnected);
    }

    fn request_connection_lost(&self, session: &SessionPtr, echo_data: EchoData) {
        let mut header = Header {
            mode: MsgMode::Reply,
            status: Status::SessionDisconnected,
            ..Header::default()
        };
        recover_reply_address(&mut header, &echo_data);
        let Some(entity) = self.entity(header.destid) else {
            return;
        };
        tracing::debug!(
            session = session.session_id(),
            "request {} lost with its connection",
            header.corrid
        );
        entity.deliver_reply(header.corrid, header.status, Metainfo::new(), None);
    }
}

impl Drop for RemoteEntityContainer {
    fn drop(&mut self) {
        self.deinit();
    }
}
