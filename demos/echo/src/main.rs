//! An echo server and a client in one process, talking over `mem://`.
//!
//! Run with `RUST_LOG=debug` to watch the handshake and routing.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, bail};
use entity_bus_core::{BindProperties, ConnectProperties, ExecutorPtr, Status, TokioExecutor};
use entity_bus_remote::{ContainerConfig, RemoteEntity, RemoteEntityContainer, TypedMessage};
use entity_bus_session::ProtocolRegistry;
use entity_bus_transport::{HeaderSizeProtocolFactory, MemoryTransport, PROTOCOL_NAME};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENDPOINT: &str = "mem://echo:headersize:json";

#[derive(Debug, Serialize, Deserialize)]
struct EchoRequest {
    text: String,
}

impl TypedMessage for EchoRequest {
    const TYPE_NAME: &'static str = "demo.EchoRequest";
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoReply {
    text: String,
    count: usize,
}

impl TypedMessage for EchoReply {
    const TYPE_NAME: &'static str = "demo.EchoReply";
}

fn container(transport: &Arc<MemoryTransport>) -> Arc<RemoteEntityContainer> {
    let protocols = Arc::new(ProtocolRegistry::new());
    protocols.register(PROTOCOL_NAME, Arc::new(HeaderSizeProtocolFactory));
    let executor: ExecutorPtr = Arc::new(TokioExecutor::current());
    let container = RemoteEntityContainer::new(
        transport.clone(),
        protocols,
        Some(executor),
        ContainerConfig::default(),
    );
    container.start_cycle_timer();
    container
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let transport = Arc::new(MemoryTransport::current());

    let server = container(&transport);
    let echo = RemoteEntity::new();
    echo.register_command_at::<EchoRequest>("/echo", |mut ctx, request| {
        tracing::info!(peer = ctx.peer_id(), "echo {:?}", request.text);
        ctx.reply(&EchoReply {
            count: request.text.chars().count(),
            text: request.text,
        });
    });
    server.register_entity(&echo, "echo")?;
    server.bind(ENDPOINT, &BindProperties::new())?;

    let mut peer_events = echo.peer_events();
    tokio::spawn(async move {
        while let Some(notification) = peer_events.next().await {
            tracing::info!(
                peer = notification.peer_id,
                incoming = notification.incoming,
                "server peer {:?}",
                notification.event
            );
        }
    });

    let client = container(&transport);
    let caller = RemoteEntity::new();
    client.register_entity(&caller, "caller")?;
    let session = client.connect(ENDPOINT, &ConnectProperties::new())?;

    let (connected, handshake) = oneshot::channel();
    let peer = caller.connect_with(&session, "echo", move |_, status| {
        let _ = connected.send(status);
    });
    let status = tokio::time::timeout(Duration::from_secs(5), handshake)
        .await
        .context("handshake timed out")??;
    if status != Status::Ok {
        bail!("connect to echo failed: {status}");
    }

    for text in ["hello", "entity bus"] {
        let reply = caller
            .request_reply_async::<EchoReply>(
                peer,
                "/echo",
                &EchoRequest {
                    text: text.to_owned(),
                },
            )
            .await;
        match reply.reply {
            Some(reply) => tracing::info!("reply {:?} ({} chars)", reply.text, reply.count),
            None => tracing::warn!("request failed: {}", reply.status),
        }
    }

    caller.disconnect(peer);
    session.disconnect();
    client.deinit();
    server.deinit();
    Ok(())
}
