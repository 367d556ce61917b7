//! Remote entity: the application-facing request, reply and event API.
//!
//! An entity owns its peers, a table of outstanding requests keyed by
//! correlation id and a command table. Three locks guard them separately
//! so that dispatch lookups never wait on request churn.

use std::{
    collections::HashMap,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use entity_bus_core::{
    CORRELATIONID_NONE, CorrelationId, ENTITYID_INVALID, EchoData, EntityId, Header, Metainfo,
    PEERID_INVALID, PeerEvent, PeerId, Status,
    executor::run_or_inline,
    header::keys,
    message::{ECHO_CORRELATION_ID, ECHO_SOURCE_ID},
};
use entity_bus_session::SessionPtr;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    dispatch::{Command, CommandTable},
    format::{FormatError, FormatRegistry, Outgoing, encode},
    messages::{ConnectEntity, ConnectEntityReply, DisconnectEntity, StructValue, TypedMessage},
    peer::{PeerEventFn, PeerManager, PeerNotification, ReadyToSend},
    request_context::{ReceiveData, RequestContext},
};

/// Entity name given to peers created by an unannounced request.
const AUTOMATIC_PEER_NAME: &str = "dummy";

type ReplyFn = Box<dyn FnOnce(PeerId, Status, Metainfo, Option<StructValue>) + Send>;

/// Low-level reply observer. Returns true when it consumed the reply.
pub type ReplyEventFn =
    Arc<dyn Fn(CorrelationId, Status, &Metainfo, Option<&StructValue>) -> bool + Send + Sync>;

/// Called once the handshake of an outgoing peer completes or fails.
pub type ConnectFn = Box<dyn FnOnce(PeerId, Status) + Send>;

/// The entity a connect targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Name(String),
    Id(EntityId),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<EntityId> for Target {
    fn from(id: EntityId) -> Self {
        Self::Id(id)
    }
}

impl Target {
    fn split(&self) -> (EntityId, &str) {
        match self {
            Self::Name(name) => (ENTITYID_INVALID, name),
            Self::Id(id) => (*id, ""),
        }
    }
}

/// Result of an awaited request.
#[derive(Debug)]
pub struct Reply<R> {
    pub status: Status,
    pub reply: Option<R>,
    pub metainfo: Metainfo,
}

struct PendingRequest {
    peer_id: PeerId,
    func: ReplyFn,
}

/// Set when the entity is registered with a container.
struct Attachment {
    name: String,
    formats: Arc<FormatRegistry>,
}

/// Decode a reply body into `R`. A body of another type yields
/// [`Status::WrongReplyType`].
fn decode_reply<R: TypedMessage>(status: Status, body: Option<StructValue>) -> (Status, Option<R>) {
    let Some(body) = body else {
        return (status, None);
    };
    match body.decode::<R>() {
        Ok(reply) => (status, Some(reply)),
        Err(e) => {
            tracing::debug!("unexpected reply: {e}");
            (Status::WrongReplyType, None)
        }
    }
}

fn send_failure_status(error: &FormatError) -> Status {
    match error {
        FormatError::UnknownContentType(_) => Status::WrongContentType,
        FormatError::Json(_) => Status::SyntaxError,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

pub struct RemoteEntity {
    this: Weak<Self>,
    peer_manager: Arc<PeerManager>,
    attachment: RwLock<Option<Attachment>>,
    next_correlation_id: AtomicU64,
    requests: Mutex<HashMap<CorrelationId, PendingRequest>>,
    commands: RwLock<CommandTable>,
    reply_events: RwLock<Arc<Vec<ReplyEventFn>>>,
    connect_lock: Mutex<()>,
}

impl RemoteEntity {
    /// Create an entity with the handshake commands installed.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let entity = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            peer_manager: Arc::new(PeerManager::new()),
            attachment: RwLock::new(None),
            next_correlation_id: AtomicU64::new(1),
            requests: Mutex::new(HashMap::new()),
            commands: RwLock::new(CommandTable::new()),
            reply_events: RwLock::new(Arc::new(Vec::new())),
            connect_lock: Mutex::new(()),
        });
        entity.register_handshake();
        entity
    }

    fn register_handshake(&self) {
        let this = self.this.clone();
        self.register_command::<ConnectEntity>(move |mut ctx, request| {
            let Some(entity) = this.upgrade() else {
                ctx.reply_status(Status::EntityNotFound);
                return;
            };
            let session = ctx.session().clone();
            let virtual_session_id = ctx.virtual_session_id().to_owned();
            let requester = ctx.entity_id();
            let own_name = entity.name();
            let entity_id = entity.entity_id();
            let mut reply = || match &own_name {
                Some(name) => ctx.reply(&ConnectEntityReply {
                    entity_id,
                    entity_name: name.clone(),
                }),
                None => ctx.reply_status(Status::EntityNotFound),
            };
            entity.peer_manager.add_peer(
                &session,
                &virtual_session_id,
                requester,
                &request.entity_name,
                true,
                Some(&mut reply),
            );
        });

        let this = self.this.clone();
        self.register_command::<DisconnectEntity>(move |ctx, _| {
            if let Some(entity) = this.upgrade() {
                entity.remove_peer(ctx.peer_id(), Status::PeerDisconnected);
            }
        });
    }

    /// Bind the entity to a container. Called on registration.
    pub(crate) fn attach(&self, entity_id: EntityId, name: &str, formats: Arc<FormatRegistry>) {
        self.peer_manager.set_entity_id(entity_id);
        *self
            .attachment
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Attachment {
            name: name.to_owned(),
            formats,
        });
    }

    pub(crate) fn detach(&self) {
        self.attachment
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn formats(&self) -> Option<Arc<FormatRegistry>> {
        self.attachment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.formats.clone())
    }

    /// Registered name, or `None` while the entity is not registered.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.attachment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.name.clone())
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.formats().is_some()
    }

    /// Id assigned by the container, [`ENTITYID_INVALID`] before registration.
    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.peer_manager.entity_id()
    }

    #[must_use]
    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    fn lock_requests(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn next_correlation_id(&self) -> CorrelationId {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Requests still waiting for their reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.lock_requests().len()
    }

    // Commands

    /// Register a handler for requests of type `R` at path `R::TYPE_NAME`.
    pub fn register_command<R: TypedMessage>(
        &self,
        handler: impl Fn(RequestContext, R) + Send + Sync + 'static,
    ) {
        self.register_command_at(R::TYPE_NAME, handler);
    }

    /// Register a handler at `path`. The path may contain `{name}` and `*`
    /// segments.
    pub fn register_command_at<R: TypedMessage>(
        &self,
        path: &str,
        handler: impl Fn(RequestContext, R) + Send + Sync + 'static,
    ) {
        let func = Arc::new(move |mut ctx: RequestContext, value: StructValue| {
            match value.decode::<R>() {
                Ok(request) => handler(ctx, request),
                Err(e) => {
                    tracing::debug!("request does not fit command: {e}");
                    ctx.reply_status(Status::RequestTypeNotKnown);
                }
            }
        });
        self.register_command_value(path, R::TYPE_NAME, func);
    }

    /// Register an untyped handler that receives the body as is.
    pub fn register_command_value(
        &self,
        path: &str,
        type_name: &str,
        func: Arc<dyn Fn(RequestContext, StructValue) + Send + Sync>,
    ) {
        self.commands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(
                path,
                Command {
                    type_name: type_name.to_owned(),
                    func,
                },
            );
    }

    /// Type of the command that would handle `path`.
    #[must_use]
    pub fn command_type(&self, path: &str) -> Option<String> {
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(path, &mut Metainfo::new())
            .map(|command| command.type_name)
    }

    /// Add a reply observer. Observers see every reply before correlation
    /// lookup, in registration order.
    pub fn register_reply_event(&self, func: ReplyEventFn) {
        let mut slot = self
            .reply_events
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut observers = Vec::clone(&slot);
        observers.push(func);
        *slot = Arc::new(observers);
    }

    pub fn register_peer_event(&self, func: PeerEventFn) {
        self.peer_manager.set_peer_event(func);
    }

    /// Peer events, starting with the recorded history.
    #[must_use]
    pub fn peer_events(&self) -> BoxStream<'static, PeerNotification> {
        self.peer_manager.events().history_plus_stream()
    }

    // Requests and events

    /// Send a request or, with [`CORRELATIONID_NONE`], an event.
    ///
    /// Requests to a peer without a session are queued on the peer. Requests
    /// that cannot be sent are answered locally with a failure status.
    pub fn send_request(
        &self,
        peer_id: PeerId,
        path: &str,
        body: &StructValue,
        correlation_id: CorrelationId,
        metainfo: Option<Metainfo>,
    ) {
        let ready = {
            let _guard = self
                .connect_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.peer_manager.get_request_header(
                peer_id,
                path,
                body,
                correlation_id,
                metainfo.as_ref(),
            )
        };

        match ready {
            ReadyToSend::Ready {
                header,
                session,
                virtual_session_id,
            } => {
                if let Err(status) =
                    self.transmit(&session, &virtual_session_id, header, body, metainfo)
                {
                    self.fail_request(correlation_id, status, Some(&session));
                }
            }
            ReadyToSend::SessionNotAvailable => {
                tracing::debug!(peer = peer_id, "queued request until the peer connects");
            }
            ReadyToSend::PeerNotAvailable => {
                tracing::debug!(peer = peer_id, "request to unknown peer");
                self.fail_request(correlation_id, Status::PeerDisconnected, None);
            }
        }
    }

    fn transmit(
        &self,
        session: &SessionPtr,
        virtual_session_id: &str,
        header: Header,
        body: &StructValue,
        metainfo: Option<Metainfo>,
    ) -> Result<(), Status> {
        let formats = self.formats().ok_or(Status::EntityNotFound)?;
        let mut echo_data = EchoData::new();
        if header.corrid != CORRELATIONID_NONE {
            echo_data.insert(ECHO_CORRELATION_ID.into(), Value::from(header.corrid));
            echo_data.insert(ECHO_SOURCE_ID.into(), Value::from(header.srcid));
        }
        let outgoing = Outgoing {
            virtual_session_id,
            echo_data,
            metainfo: metainfo.unwrap_or_default(),
            ..Outgoing::new(header, Some(body))
        };
        match formats.send(session, outgoing) {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(session = session.session_id(), "failed to send request: {e}");
                Err(send_failure_status(&e))
            }
        }
    }

    /// Answer an outstanding request locally.
    fn fail_request(&self, correlation_id: CorrelationId, status: Status, session: Option<&SessionPtr>) {
        if correlation_id == CORRELATIONID_NONE {
            return;
        }
        let this = self.this.clone();
        run_or_inline(session.and_then(|s| s.executor()), move || {
            if let Some(entity) = this.upgrade() {
                entity.deliver_reply(correlation_id, status, Metainfo::new(), None);
            }
        });
    }

    fn send_typed<M: TypedMessage>(
        &self,
        peer_id: PeerId,
        path: &str,
        message: &M,
        correlation_id: CorrelationId,
        metainfo: Option<Metainfo>,
    ) {
        match encode(message) {
            Some(body) => self.send_request(peer_id, path, &body, correlation_id, metainfo),
            None => self.fail_request(correlation_id, Status::SyntaxError, None),
        }
    }

    fn add_request(&self, peer_id: PeerId, func: ReplyFn) -> CorrelationId {
        let correlation_id = self.next_correlation_id();
        self.lock_requests()
            .insert(correlation_id, PendingRequest { peer_id, func });
        correlation_id
    }

    /// Send a request and call `on_reply` with the outcome.
    ///
    /// An empty `path` addresses the command registered under the request's
    /// type name.
    pub fn request_reply<R: TypedMessage>(
        &self,
        peer_id: PeerId,
        path: &str,
        request: &impl TypedMessage,
        on_reply: impl FnOnce(PeerId, Status, Option<R>) + Send + 'static,
    ) -> CorrelationId {
        let correlation_id = self.add_request(
            peer_id,
            Box::new(move |peer_id, status, _metainfo, body| {
                let (status, reply) = decode_reply::<R>(status, body);
                on_reply(peer_id, status, reply);
            }),
        );
        self.send_typed(peer_id, path, request, correlation_id, None);
        correlation_id
    }

    /// Like [`Self::request_reply`], with metainfo in both directions.
    pub fn request_reply_meta<R: TypedMessage>(
        &self,
        peer_id: PeerId,
        path: &str,
        metainfo: Metainfo,
        request: &impl TypedMessage,
        on_reply: impl FnOnce(PeerId, Status, Metainfo, Option<R>) + Send + 'static,
    ) -> CorrelationId {
        let correlation_id = self.add_request(
            peer_id,
            Box::new(move |peer_id, status, metainfo, body| {
                let (status, reply) = decode_reply::<R>(status, body);
                on_reply(peer_id, status, metainfo, reply);
            }),
        );
        self.send_typed(peer_id, path, request, correlation_id, Some(metainfo));
        correlation_id
    }

    /// Send a request and await its reply.
    pub fn request_reply_async<R: TypedMessage>(
        &self,
        peer_id: PeerId,
        path: &str,
        request: &impl TypedMessage,
    ) -> impl Future<Output = Reply<R>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();
        self.request_reply_meta::<R>(
            peer_id,
            path,
            Metainfo::new(),
            request,
            move |_, status, metainfo, reply| {
                let _ = sender.send(Reply {
                    status,
                    reply,
                    metainfo,
                });
            },
        );
        async move {
            receiver.await.unwrap_or(Reply {
                status: Status::NoReply,
                reply: None,
                metainfo: Metainfo::new(),
            })
        }
    }

    /// Forget an outstanding request. Returns whether it was still pending.
    pub fn cancel_reply(&self, correlation_id: CorrelationId) -> bool {
        correlation_id != CORRELATIONID_NONE
            && self.lock_requests().remove(&correlation_id).is_some()
    }

    pub fn send_event(&self, peer_id: PeerId, path: &str, event: &impl TypedMessage) {
        self.send_typed(peer_id, path, event, CORRELATIONID_NONE, None);
    }

    pub fn send_event_meta(
        &self,
        peer_id: PeerId,
        path: &str,
        metainfo: Metainfo,
        event: &impl TypedMessage,
    ) {
        self.send_typed(peer_id, path, event, CORRELATIONID_NONE, Some(metainfo));
    }

    pub fn send_event_to_all_peers(&self, path: &str, event: &impl TypedMessage) {
        let Some(body) = encode(event) else {
            return;
        };
        for peer_id in self.all_peers() {
            self.send_request(peer_id, path, &body, CORRELATIONID_NONE, None);
        }
    }

    // Peers

    #[must_use]
    pub fn all_peers(&self) -> Vec<PeerId> {
        self.peer_manager.all_peers()
    }

    #[must_use]
    pub fn session_of(&self, peer_id: PeerId) -> Option<SessionPtr> {
        self.peer_manager.session(peer_id)
    }

    /// Connect to an entity reachable over `session`.
    ///
    /// The peer is usable at once; requests sent before the handshake
    /// completes go out behind it.
    pub fn connect(&self, session: &SessionPtr, target: impl Into<Target>) -> PeerId {
        self.connect_intern(session, "", &target.into(), None)
    }

    /// Like [`Self::connect`], reporting the handshake outcome.
    pub fn connect_with(
        &self,
        session: &SessionPtr,
        target: impl Into<Target>,
        on_connect: impl FnOnce(PeerId, Status) + Send + 'static,
    ) -> PeerId {
        self.connect_intern(session, "", &target.into(), Some(Box::new(on_connect)))
    }

    fn connect_intern(
        &self,
        session: &SessionPtr,
        virtual_session_id: &str,
        target: &Target,
        on_connect: Option<ConnectFn>,
    ) -> PeerId {
        let (entity_id, entity_name) = target.split();
        let (peer_id, added) = self.peer_manager.add_peer(
            session,
            virtual_session_id,
            entity_id,
            entity_name,
            false,
            None,
        );
        if added {
            self.send_connect_entity(peer_id, on_connect);
        }
        peer_id
    }

    /// Create a peer without a session. Requests to it are queued until
    /// [`Self::connect_peer`] binds it.
    pub fn create_peer(&self, on_connect: Option<ConnectFn>) -> PeerId {
        let peer_id = self.peer_manager.add_unbound_peer();
        self.send_connect_entity(peer_id, on_connect);
        peer_id
    }

    /// Bind a peer from [`Self::create_peer`] and flush its queue in order.
    pub fn connect_peer(&self, peer_id: PeerId, session: &SessionPtr, target: impl Into<Target>) {
        let target = target.into();
        let (entity_id, entity_name) = target.split();
        let mut failed = None;
        {
            let _guard = self
                .connect_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(queued) = self
                .peer_manager
                .connect(peer_id, session, entity_id, entity_name)
            else {
                return;
            };
            for request in queued {
                let ready = self.peer_manager.get_request_header(
                    peer_id,
                    &request.path,
                    &request.body,
                    request.correlation_id,
                    None,
                );
                let ReadyToSend::Ready {
                    header,
                    session,
                    virtual_session_id,
                } = ready
                else {
                    failed = Some(Status::SessionDisconnected);
                    break;
                };
                let metainfo = Some(request.metainfo);
                if let Err(status) =
                    self.transmit(&session, &virtual_session_id, header, &request.body, metainfo)
                {
                    self.fail_request(request.correlation_id, status, Some(&session));
                }
            }
        }
        if let Some(status) = failed {
            self.remove_peer(peer_id, status);
        }
    }

    /// A peer for publishing to an entity that never handshakes.
    pub fn create_publish_peer(&self, session: &SessionPtr, entity_name: &str) -> PeerId {
        self.peer_manager
            .add_peer(session, "", ENTITYID_INVALID, entity_name, true, None)
            .0
    }

    fn send_connect_entity(&self, peer_id: PeerId, on_connect: Option<ConnectFn>) {
        let Some(own_name) = self.name() else {
            tracing::warn!(peer = peer_id, "connect from an unregistered entity");
            if let Some(on_connect) = on_connect {
                on_connect(peer_id, Status::PeerDisconnected);
            }
            return;
        };
        let this = self.this.clone();
        self.request_reply_meta::<ConnectEntityReply>(
            peer_id,
            "",
            Metainfo::new(),
            &ConnectEntity {
                entity_name: own_name,
            },
            move |peer_id, status, metainfo, reply| {
                let Some(entity) = this.upgrade() else {
                    if let Some(on_connect) = on_connect {
                        on_connect(peer_id, status);
                    }
                    return;
                };
                if let Some(reply) = reply {
                    let virtual_session_id = metainfo
                        .get(keys::VIRTUAL_SESSION_ID)
                        .map_or("", String::as_str);
                    entity.peer_manager.update_peer(
                        peer_id,
                        virtual_session_id,
                        reply.entity_id,
                        &reply.entity_name,
                    );
                } else if status == Status::EntityNotFound {
                    entity.remove_peer(peer_id, status);
                }
                if let Some(on_connect) = on_connect {
                    on_connect(peer_id, status);
                }
            },
        );
    }

    /// Tell the peer goodbye and remove it.
    pub fn disconnect(&self, peer_id: PeerId) {
        self.send_event(peer_id, "", &DisconnectEntity {});
        self.remove_peer(peer_id, Status::PeerDisconnected);
    }

    /// Remove a peer, failing its outstanding requests with `status`.
    pub fn remove_peer(&self, peer_id: PeerId, status: Status) {
        if peer_id == PEERID_INVALID {
            return;
        }
        let Some(removed) = self.peer_manager.remove_peer(peer_id) else {
            return;
        };

        let mut failed: Vec<(CorrelationId, PendingRequest)> = {
            let mut requests = self.lock_requests();
            let ids: Vec<CorrelationId> = requests
                .iter()
                .filter(|(_, request)| request.peer_id == peer_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| requests.remove(&id).map(|request| (id, request)))
                .collect()
        };
        failed.sort_unstable_by_key(|(id, _)| *id);
        tracing::debug!(peer = peer_id, %status, failed = failed.len(), "peer removed");
        for (_, request) in failed {
            (request.func)(peer_id, status, Metainfo::new(), None);
        }

        if let Some(session) = removed.session {
            if session.capabilities().send_request_by_poll
                && self
                    .peer_manager
                    .peers_with_session(session.session_id())
                    .is_empty()
            {
                session.release_poll();
            }
            self.peer_manager.fire_peer_event(
                peer_id,
                &session,
                removed.entity_id,
                PeerEvent::Disconnected,
                removed.incoming,
            );
        }
    }

    // Container-facing entry points

    /// A request addressed to this entity arrived.
    pub fn received_request(&self, mut data: ReceiveData, automatic_connect: bool) {
        let Some(formats) = self.formats() else {
            tracing::warn!("request for an unregistered entity dropped");
            return;
        };
        if automatic_connect {
            let srcid = match data.header.srcid {
                0 => ENTITYID_INVALID,
                id => id,
            };
            self.peer_manager.add_peer(
                &data.session,
                &data.virtual_session_id,
                srcid,
                AUTOMATIC_PEER_NAME,
                true,
                None,
            );
        }

        let command = self
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(&data.header.path, &mut data.metainfo);
        let mut ctx = RequestContext::new(
            self.peer_manager.clone(),
            formats,
            self.entity_id(),
            &data,
        );
        let (Some(command), Some(body)) = (command, data.body) else {
            tracing::debug!(path = %data.header.path, "no command for request");
            ctx.reply_status(Status::RequestNotFound);
            return;
        };

        let func = command.func;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(move || func(ctx, body))) {
            tracing::error!(
                path = %data.header.path,
                "command handler panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }

    /// A reply addressed to this entity arrived.
    pub fn received_reply(&self, data: ReceiveData) {
        let ReceiveData {
            session,
            virtual_session_id,
            header,
            body,
            mut metainfo,
            ..
        } = data;
        if !virtual_session_id.is_empty() {
            metainfo.insert(keys::VIRTUAL_SESSION_ID.into(), virtual_session_id.clone());
        }
        self.deliver_reply(header.corrid, header.status, metainfo, body);

        if header.status == Status::EntityNotFound && header.srcid != ENTITYID_INVALID {
            let peer_id = self.peer_manager.peer_id(
                session.session_id(),
                &virtual_session_id,
                header.srcid,
                "",
            );
            self.remove_peer(peer_id, Status::PeerDisconnected);
        }
    }

    /// Run reply observers, then the callback stored for `correlation_id`.
    pub(crate) fn deliver_reply(
        &self,
        correlation_id: CorrelationId,
        status: Status,
        metainfo: Metainfo,
        body: Option<StructValue>,
    ) {
        let observers = Arc::clone(
            &self
                .reply_events
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if observers
            .iter()
            .any(|observer| observer(correlation_id, status, &metainfo, body.as_ref()))
        {
            return;
        }

        let request = self.lock_requests().remove(&correlation_id);
        match request {
            Some(request) => (request.func)(request.peer_id, status, metainfo, body),
            None if correlation_id != CORRELATIONID_NONE => {
                tracing::debug!("reply for unknown correlation id {correlation_id}");
            }
            None => {}
        }
    }

    /// Remove every peer reached over `session`.
    pub fn session_disconnected(&self, session: &SessionPtr) {
        for peer_id in self.peer_manager.peers_with_session(session.session_id()) {
            self.remove_peer(peer_id, Status::SessionDisconnected);
        }
    }

    pub fn virtual_session_disconnected(&self, session: &SessionPtr, virtual_session_id: &str) {
        for peer_id in self
            .peer_manager
            .peers_with_virtual_session(session.session_id(), virtual_session_id)
        {
            self.remove_peer(peer_id, Status::SessionDisconnected);
        }
    }

    /// Remove all peers, failing their requests.
    pub fn deinit(&self) {
        for peer_id in self.all_peers() {
            self.remove_peer(peer_id, Status::PeerDisconnected);
        }
    }
}

impl Drop for RemoteEntity {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use entity_bus_core::MsgMode;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::testing::Harness;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        value: i32,
    }

    impl TypedMessage for Echo {
        const TYPE_NAME: &'static str = "test.Echo";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other {}

    impl TypedMessage for Other {
        const TYPE_NAME: &'static str = "test.Other";
    }

    type Outcomes = Arc<StdMutex<Vec<(Status, Option<Echo>)>>>;

    fn attached(harness: &Harness) -> Arc<RemoteEntity> {
        let entity = RemoteEntity::new();
        entity.attach(1, "me", harness.formats.clone());
        entity
    }

    fn record(outcomes: &Outcomes) -> impl FnOnce(PeerId, Status, Option<Echo>) + Send + 'static {
        let outcomes = outcomes.clone();
        move |_, status, reply| outcomes.lock().unwrap().push((status, reply))
    }

    fn request(harness: &Harness, path: &str, body: Option<StructValue>, corrid: u64) -> ReceiveData {
        ReceiveData {
            session: harness.session.clone(),
            virtual_session_id: String::new(),
            header: Header {
                destid: 1,
                srcid: 9,
                path: path.to_owned(),
                type_name: body.as_ref().map(|b| b.type_name().to_owned()).unwrap_or_default(),
                corrid,
                ..Header::default()
            },
            body,
            metainfo: Metainfo::new(),
            echo_data: EchoData::new(),
            raw_data: None,
        }
    }

    fn reply(harness: &Harness, corrid: u64, status: Status, body: Option<StructValue>) -> ReceiveData {
        let mut data = request(harness, "", body, corrid);
        data.header.mode = MsgMode::Reply;
        data.header.status = status;
        data
    }

    fn echo(value: i32) -> StructValue {
        StructValue::from_message(&Echo { value }).unwrap()
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let outcomes: Outcomes = Arc::default();
        let ids: Vec<CorrelationId> = (0..5)
            .map(|i| entity.request_reply(peer, "", &Echo { value: i }, record(&outcomes)))
            .collect();
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(unique.len(), 5);
        assert!(ids.iter().all(|id| *id != CORRELATIONID_NONE));

        // deliver out of order: each callback gets its own reply
        entity.received_reply(reply(&harness, ids[3], Status::Ok, Some(echo(3))));
        entity.received_reply(reply(&harness, ids[1], Status::Ok, Some(echo(1))));
        let got = outcomes.lock().unwrap().clone();
        assert_eq!(got, vec![
            (Status::Ok, Some(Echo { value: 3 })),
            (Status::Ok, Some(Echo { value: 1 })),
        ]);
    }

    #[test]
    fn test_request_to_unknown_peer_fails_locally() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let outcomes: Outcomes = Arc::default();
        entity.request_reply(42, "", &Echo { value: 1 }, record(&outcomes));
        assert_eq!(*outcomes.lock().unwrap(), vec![(Status::PeerDisconnected, None)]);
        assert_eq!(entity.pending_requests(), 0);
    }

    #[test]
    fn test_teardown_fails_outstanding_requests() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let outcomes: Outcomes = Arc::default();
        entity.request_reply(peer, "", &Echo { value: 1 }, record(&outcomes));
        entity.request_reply(peer, "", &Echo { value: 2 }, record(&outcomes));

        entity.remove_peer(peer, Status::PeerDisconnected);
        assert_eq!(*outcomes.lock().unwrap(), vec![
            (Status::PeerDisconnected, None),
            (Status::PeerDisconnected, None),
        ]);
        // the handshake request was failed too
        assert_eq!(entity.pending_requests(), 0);
        assert!(entity.all_peers().is_empty());
    }

    #[test]
    fn test_cancel_reply() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let outcomes: Outcomes = Arc::default();
        let id = entity.request_reply(peer, "", &Echo { value: 1 }, record(&outcomes));
        assert!(entity.cancel_reply(id));
        assert!(!entity.cancel_reply(id));
        assert!(!entity.cancel_reply(CORRELATIONID_NONE));
        entity.received_reply(reply(&harness, id, Status::Ok, Some(echo(1))));
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reply_type_mismatch() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let outcomes: Outcomes = Arc::default();
        let id = entity.request_reply(peer, "", &Echo { value: 1 }, record(&outcomes));
        let other = StructValue::from_message(&Other {}).unwrap();
        entity.received_reply(reply(&harness, id, Status::Ok, Some(other)));
        assert_eq!(*outcomes.lock().unwrap(), vec![(Status::WrongReplyType, None)]);
    }

    #[test]
    fn test_reply_observer_short_circuits() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let outcomes: Outcomes = Arc::default();
        let id = entity.request_reply(peer, "", &Echo { value: 1 }, record(&outcomes));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        entity.register_reply_event(Arc::new(move |corrid, _, _, _| {
            log.lock().unwrap().push(corrid);
            corrid == 1000
        }));
        entity.received_reply(reply(&harness, 1000, Status::Ok, None));
        entity.received_reply(reply(&harness, id, Status::Ok, Some(echo(1))));
        assert_eq!(*seen.lock().unwrap(), vec![1000, id]);
        assert_eq!(outcomes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dispatch_replies_with_handler_result() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        entity.register_command_at::<Echo>("/echo/{id}", |mut ctx, request| {
            assert_eq!(ctx.metainfo("PATH_id"), Some("7"));
            ctx.reply(&request);
        });
        entity.received_request(request(&harness, "/echo/7", Some(echo(5)), 3), false);

        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.mode, MsgMode::Reply);
        assert_eq!(sent[0].header.corrid, 3);
        assert_eq!(sent[0].header.destid, 9);
        assert_eq!(sent[0].body.as_ref().unwrap().decode::<Echo>().unwrap().value, 5);
    }

    #[test]
    fn test_dispatch_failure_statuses() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        entity.register_command::<Echo>(|_, _| panic!("boom"));

        entity.received_request(request(&harness, "/missing", Some(echo(1)), 1), false);
        let other = StructValue::from_message(&Other {}).unwrap();
        entity.received_request(request(&harness, Echo::TYPE_NAME, Some(other), 2), false);
        entity.received_request(request(&harness, Echo::TYPE_NAME, Some(echo(1)), 3), false);

        let statuses: Vec<(u64, Status)> = harness
            .sent()
            .iter()
            .map(|m| (m.header.corrid, m.header.status))
            .collect();
        assert_eq!(statuses, vec![
            (1, Status::RequestNotFound),
            (2, Status::RequestTypeNotKnown),
            (3, Status::RequestProcessingError),
        ]);
    }

    #[test]
    fn test_automatic_connect_creates_incoming_peer() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        entity.register_command::<Echo>(|_, _| {});
        let mut data = request(&harness, Echo::TYPE_NAME, Some(echo(1)), 0);
        data.header.srcid = 0;
        entity.received_request(data, true);

        let peers = entity.all_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(entity.peer_manager().entity_name(peers[0]).as_deref(), Some("dummy"));
        assert_eq!(entity.peer_manager().peer_entity_id(peers[0]), Some(ENTITYID_INVALID));
    }

    #[test]
    fn test_connect_entity_handshake_replies_before_event() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let sent_at_event = Arc::new(StdMutex::new(None));
        let probe = sent_at_event.clone();
        let protocol = harness.protocol.clone();
        entity.register_peer_event(Arc::new(move |_, _, _, event, incoming| {
            assert_eq!(event, PeerEvent::Connected);
            assert!(incoming);
            *probe.lock().unwrap() = Some(protocol.sent.lock().unwrap().len());
        }));
        let hello = StructValue::from_message(&ConnectEntity {
            entity_name: "client".into(),
        })
        .unwrap();
        entity.received_request(request(&harness, ConnectEntity::TYPE_NAME, Some(hello.clone()), 1), false);
        entity.received_request(request(&harness, ConnectEntity::TYPE_NAME, Some(hello), 2), false);

        assert_eq!(*sent_at_event.lock().unwrap(), Some(1));
        let sent = harness.sent();
        // a repeated handshake is answered but adds no peer
        assert_eq!(sent.len(), 2);
        let reply = sent[1].body.as_ref().unwrap().decode::<ConnectEntityReply>().unwrap();
        assert_eq!(reply.entity_id, 1);
        assert_eq!(reply.entity_name, "me");
        assert_eq!(entity.all_peers().len(), 1);
    }

    #[test]
    fn test_handshake_reply_updates_peer() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let status = Arc::new(StdMutex::new(None));
        let observed = status.clone();
        let peer = entity.connect_with(&harness.session, "server", move |_, s| {
            *observed.lock().unwrap() = Some(s);
        });
        let handshake = &harness.sent()[0];
        assert_eq!(handshake.header.destname, "server");
        let corrid = handshake.header.corrid;

        let answer = StructValue::from_message(&ConnectEntityReply {
            entity_id: 77,
            entity_name: "server".into(),
        })
        .unwrap();
        entity.received_reply(reply(&harness, corrid, Status::Ok, Some(answer)));
        assert_eq!(*status.lock().unwrap(), Some(Status::Ok));
        assert_eq!(entity.peer_manager().peer_entity_id(peer), Some(77));

        entity.send_event(peer, "", &Echo { value: 1 });
        assert_eq!(harness.sent().last().unwrap().header.destid, 77);
    }

    #[test]
    fn test_created_peer_flushes_in_order() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.create_peer(None);
        entity.send_event(peer, "a", &Echo { value: 1 });
        entity.send_event(peer, "b", &Echo { value: 2 });
        assert!(harness.sent().is_empty());

        entity.connect_peer(peer, &harness.session, "server");
        let paths: Vec<String> = harness.sent().into_iter().map(|m| m.header.path).collect();
        assert_eq!(paths, vec![ConnectEntity::TYPE_NAME, "a", "b"]);
    }

    #[test]
    fn test_unregistered_entity_cannot_connect() {
        let harness = Harness::plain();
        let entity = RemoteEntity::new();
        let status = Arc::new(StdMutex::new(None));
        let observed = status.clone();
        entity.connect_with(&harness.session, "server", move |_, s| {
            *observed.lock().unwrap() = Some(s);
        });
        assert_eq!(*status.lock().unwrap(), Some(Status::PeerDisconnected));
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn test_session_disconnect_cascades() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let outcomes: Outcomes = Arc::default();
        entity.request_reply(peer, "", &Echo { value: 1 }, record(&outcomes));
        entity.session_disconnected(&harness.session);
        assert_eq!(*outcomes.lock().unwrap(), vec![(Status::SessionDisconnected, None)]);
        let history = entity.peer_manager().events().get_history();
        assert_eq!(history.last().unwrap().event, PeerEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_request_reply_async() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let pending = entity.request_reply_async::<Echo>(peer, "/echo", &Echo { value: 4 });
        let corrid = harness.sent().last().unwrap().header.corrid;
        entity.received_reply(reply(&harness, corrid, Status::Ok, Some(echo(4))));
        let result = pending.await;
        assert_eq!(result.status, Status::Ok);
        assert_eq!(result.reply, Some(Echo { value: 4 }));
    }

    #[test]
    fn test_request_reply_async_after_teardown() {
        let harness = Harness::plain();
        let entity = attached(&harness);
        let peer = entity.connect(&harness.session, "server");
        let pending = entity.request_reply_async::<Echo>(peer, "/echo", &Echo { value: 4 });
        entity.deinit();
        let result = tokio_test::block_on(pending);
        assert_eq!(result.status, Status::PeerDisconnected);
        assert!(result.reply.is_none());
    }

    #[test]
    fn test_command_type_lookup() {
        let entity = RemoteEntity::new();
        entity.register_command_at::<Echo>("items/{id}", |_, _| {});
        assert_eq!(entity.command_type("items/3").as_deref(), Some(Echo::TYPE_NAME));
        assert_eq!(
            entity.command_type(ConnectEntity::TYPE_NAME).as_deref(),
            Some(ConnectEntity::TYPE_NAME)
        );
        assert!(entity.command_type("nothing").is_none());
    }
}
