//! Two containers talking over the in-process transport.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use entity_bus_core::{
    BindProperties, ConnectProperties, ExecutorPtr, PeerEvent, PeerId, Status, TokioExecutor,
};
use entity_bus_remote::{
    ContainerConfig, RemoteEntity, RemoteEntityContainer, RequestContext, TypedMessage,
};
use entity_bus_session::{ProtocolRegistry, SessionPtr};
use entity_bus_transport::{HeaderSizeProtocolFactory, MemoryTransport, PROTOCOL_NAME};
use futures::{StreamExt, future::join_all};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot};

const ENDPOINT: &str = "mem://server:headersize:json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Msg {
    val: i32,
}

impl TypedMessage for Msg {
    const TYPE_NAME: &'static str = "test.Msg";
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Requests parked by the `/hold` handler.
#[derive(Default)]
struct Held {
    contexts: Mutex<Vec<RequestContext>>,
    arrived: Notify,
}

struct Fixture {
    server: Arc<RemoteEntityContainer>,
    server_entity: Arc<RemoteEntity>,
    client: Arc<RemoteEntityContainer>,
    client_entity: Arc<RemoteEntity>,
    session: SessionPtr,
    held: Arc<Held>,
}

fn container(transport: &Arc<MemoryTransport>) -> Arc<RemoteEntityContainer> {
    let protocols = Arc::new(ProtocolRegistry::new());
    protocols.register(PROTOCOL_NAME, Arc::new(HeaderSizeProtocolFactory));
    let executor: ExecutorPtr = Arc::new(TokioExecutor::current());
    RemoteEntityContainer::new(
        transport.clone(),
        protocols,
        Some(executor),
        ContainerConfig::default(),
    )
}

fn server_entity(held: &Arc<Held>) -> Arc<RemoteEntity> {
    let entity = RemoteEntity::new();
    entity.register_command_at::<Msg>("/echo", |mut ctx, msg| ctx.reply(&msg));
    entity.register_command_at::<Msg>("/silent", |_ctx, _msg| {});
    entity.register_command_at::<Msg>("/panic", |_ctx, _msg| panic!("handler failed"));
    entity.register_command_at::<Msg>("/later", |ctx, msg| {
        let mut ctx = ctx.delay_reply();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.reply(&Msg { val: msg.val * 2 });
        });
    });
    let held = held.clone();
    entity.register_command_at::<Msg>("/hold", move |ctx, _msg| {
        held.contexts.lock().unwrap().push(ctx);
        held.arrived.notify_one();
    });
    entity
}

impl Fixture {
    async fn new() -> Self {
        let transport = Arc::new(MemoryTransport::current());
        let held = Arc::new(Held::default());

        let server = container(&transport);
        let server_entity = server_entity(&held);
        server.register_entity(&server_entity, "server").unwrap();
        server.bind(ENDPOINT, &BindProperties::new()).unwrap();

        let client = container(&transport);
        let client_entity = RemoteEntity::new();
        client.register_entity(&client_entity, "client").unwrap();
        let session = client.connect(ENDPOINT, &ConnectProperties::new()).unwrap();

        Self {
            server,
            server_entity,
            client,
            client_entity,
            session,
            held,
        }
    }

    /// Connect the client entity to `target` and wait for the handshake.
    async fn connect(&self, target: &str) -> (PeerId, Status) {
        let (sender, receiver) = oneshot::channel();
        let peer = self
            .client_entity
            .connect_with(&self.session, target, move |_, status| {
                let _ = sender.send(status);
            });
        (peer, within(receiver).await.unwrap())
    }

    async fn request(&self, peer: PeerId, path: &str, val: i32) -> (Status, Option<Msg>) {
        let reply = within(
            self.client_entity
                .request_reply_async::<Msg>(peer, path, &Msg { val }),
        )
        .await;
        (reply.status, reply.reply)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_round_trip() {
    let fx = Fixture::new().await;
    let (peer, status) = fx.connect("server").await;
    assert_eq!(status, Status::Ok);

    assert_eq!(fx.request(peer, "/echo", 5).await, (Status::Ok, Some(Msg { val: 5 })));
    assert_eq!(fx.client.all_entities().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_routing_failures() {
    let fx = Fixture::new().await;
    let (peer, _) = fx.connect("server").await;

    assert_eq!(fx.request(peer, "/missing", 1).await, (Status::RequestNotFound, None));
    assert_eq!(fx.request(peer, "/silent", 1).await, (Status::NoReply, None));
    assert_eq!(
        fx.request(peer, "/panic", 1).await,
        (Status::RequestProcessingError, None)
    );
    // the dispatcher survives a panicking handler
    assert_eq!(fx.request(peer, "/echo", 2).await, (Status::Ok, Some(Msg { val: 2 })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_entity() {
    let fx = Fixture::new().await;
    let (peer, status) = fx.connect("nobody").await;
    assert_eq!(status, Status::EntityNotFound);
    assert!(!fx.client_entity.all_peers().contains(&peer));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delayed_reply() {
    let fx = Fixture::new().await;
    let (peer, _) = fx.connect("server").await;
    assert_eq!(fx.request(peer, "/later", 4).await, (Status::Ok, Some(Msg { val: 8 })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_get_their_own_replies() {
    let fx = Fixture::new().await;
    let (peer, _) = fx.connect("server").await;

    let pending: Vec<_> = (0..20)
        .map(|val| {
            fx.client_entity
                .request_reply_async::<Msg>(peer, "/echo", &Msg { val })
        })
        .collect();
    let replies = within(join_all(pending)).await;
    for (val, reply) in (0..20).zip(replies) {
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.reply, Some(Msg { val }));
    }
    assert_eq!(fx.client_entity.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_events_on_both_sides() {
    let fx = Fixture::new().await;
    let mut server_events = fx.server_entity.peer_events();
    let mut client_events = fx.client_entity.peer_events();
    fx.connect("server").await;

    let incoming = within(server_events.next()).await.unwrap();
    assert_eq!(incoming.event, PeerEvent::Connected);
    assert!(incoming.incoming);
    let outgoing = within(client_events.next()).await.unwrap();
    assert_eq!(outgoing.event, PeerEvent::Connected);
    assert!(!outgoing.incoming);
    assert_eq!(outgoing.entity_id, fx.server.entity_id("server").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_disconnect_fails_request_in_flight() {
    let fx = Fixture::new().await;
    let (peer, _) = fx.connect("server").await;

    let pending = fx
        .client_entity
        .request_reply_async::<Msg>(peer, "/hold", &Msg { val: 1 });
    within(fx.held.arrived.notified()).await;

    let client_peer = fx.server_entity.all_peers()[0];
    fx.server_entity.disconnect(client_peer);

    let reply = within(pending).await;
    assert_eq!(reply.status, Status::PeerDisconnected);
    assert!(reply.reply.is_none());
    assert!(fx.client_entity.all_peers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_disconnect_fails_request_in_flight() {
    let fx = Fixture::new().await;
    let (peer, _) = fx.connect("server").await;
    let mut client_events = fx.client_entity.peer_events();

    let pending = fx
        .client_entity
        .request_reply_async::<Msg>(peer, "/hold", &Msg { val: 1 });
    within(fx.held.arrived.notified()).await;
    fx.session.disconnect();

    let reply = within(pending).await;
    assert_eq!(reply.status, Status::SessionDisconnected);
    assert_eq!(fx.client_entity.pending_requests(), 0);

    // history replays CONNECTED first
    let events: Vec<PeerEvent> = within(client_events.by_ref().take(2).collect::<Vec<_>>())
        .await
        .into_iter()
        .map(|n| n.event)
        .collect();
    assert_eq!(events, vec![PeerEvent::Connected, PeerEvent::Disconnected]);
}
