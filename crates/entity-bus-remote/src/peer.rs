//! Peer bookkeeping for one entity.
//!
//! A peer is a remote entity reached over a session. Peers are indexed by
//! `(session id, virtual session id)` and then by entity id or entity name.
//! An id lookup is used whenever the entity id is valid, the name otherwise.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use entity_bus_core::{
    CorrelationId, ENTITYID_INVALID, EntityId, EventHub, Header, Metainfo, MsgMode, PEERID_INVALID,
    PeerEvent, PeerId, SessionId, Status,
};
use entity_bus_session::SessionPtr;

use crate::messages::StructValue;

/// Application callback for peer events.
pub type PeerEventFn = Arc<dyn Fn(PeerId, &SessionPtr, EntityId, PeerEvent, bool) + Send + Sync>;

/// A peer event as published on the event hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNotification {
    pub peer_id: PeerId,
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub event: PeerEvent,
    pub incoming: bool,
}

/// A request waiting for its peer to get a session.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub path: String,
    pub body: StructValue,
    pub correlation_id: CorrelationId,
    pub metainfo: Metainfo,
}

/// Result of resolving a request header.
pub enum ReadyToSend {
    /// Send now.
    Ready {
        header: Header,
        session: SessionPtr,
        virtual_session_id: String,
    },
    /// The peer exists but has no session yet. The request was queued.
    SessionNotAvailable,
    /// No such peer.
    PeerNotAvailable,
}

/// A removed peer, returned so the caller can fail its requests and fire events.
pub struct RemovedPeer {
    pub session: Option<SessionPtr>,
    pub entity_id: EntityId,
    pub incoming: bool,
}

struct Peer {
    session: Option<SessionPtr>,
    virtual_session_id: String,
    entity_id: EntityId,
    entity_name: String,
    incoming: bool,
    /// `Some` until the peer is connected to a session.
    queued: Option<Vec<QueuedRequest>>,
}

#[derive(Default)]
struct SessionIndex {
    by_id: HashMap<EntityId, PeerId>,
    by_name: HashMap<String, PeerId>,
}

impl SessionIndex {
    fn insert(&mut self, entity_id: EntityId, entity_name: &str, peer_id: PeerId) {
        if entity_id != ENTITYID_INVALID {
            self.by_id.insert(entity_id, peer_id);
        }
        if !entity_name.is_empty() {
            self.by_name.insert(entity_name.to_owned(), peer_id);
        }
    }

    fn lookup(&self, entity_id: EntityId, entity_name: &str) -> Option<PeerId> {
        if entity_id == ENTITYID_INVALID {
            self.by_name.get(entity_name).copied()
        } else {
            self.by_id.get(&entity_id).copied()
        }
    }

    fn remove_peer(&mut self, peer_id: PeerId) {
        self.by_id.retain(|_, id| *id != peer_id);
        self.by_name.retain(|_, id| *id != peer_id);
    }

    fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.by_name.is_empty()
    }
}

struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    next_peer_id: PeerId,
    index: HashMap<SessionId, HashMap<String, SessionIndex>>,
}

impl PeerTable {
    fn lookup(
        &self,
        session_id: SessionId,
        virtual_session_id: &str,
        entity_id: EntityId,
        entity_name: &str,
    ) -> Option<PeerId> {
        self.index
            .get(&session_id)?
            .get(virtual_session_id)?
            .lookup(entity_id, entity_name)
    }

    fn index_peer(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get(&peer_id) else {
            return;
        };
        let Some(session) = &peer.session else {
            return;
        };
        self.index
            .entry(session.session_id())
            .or_default()
            .entry(peer.virtual_session_id.clone())
            .or_default()
            .insert(peer.entity_id, &peer.entity_name, peer_id);
    }

    fn unindex_peer(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get(&peer_id) else {
            return;
        };
        let Some(session) = &peer.session else {
            return;
        };
        let session_id = session.session_id();
        if let Some(virtual_sessions) = self.index.get_mut(&session_id) {
            if let Some(index) = virtual_sessions.get_mut(&peer.virtual_session_id) {
                index.remove_peer(peer_id);
                if index.is_empty() {
                    virtual_sessions.remove(&peer.virtual_session_id);
                }
            }
            if virtual_sessions.is_empty() {
                self.index.remove(&session_id);
            }
        }
    }

    fn create(&mut self, peer: Peer) -> PeerId {
        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.insert(peer_id, peer);
        self.index_peer(peer_id);
        peer_id
    }
}

/// Peers of one entity.
pub struct PeerManager {
    entity_id: AtomicU64,
    table: Mutex<PeerTable>,
    peer_event: RwLock<Option<PeerEventFn>>,
    events: EventHub<PeerNotification>,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entity_id: AtomicU64::new(ENTITYID_INVALID),
            table: Mutex::new(PeerTable {
                peers: HashMap::new(),
                next_peer_id: PEERID_INVALID + 1,
                index: HashMap::new(),
            }),
            peer_event: RwLock::new(None),
            events: EventHub::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PeerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Own entity id, written into the source of every request header.
    pub fn set_entity_id(&self, entity_id: EntityId) {
        self.entity_id.store(entity_id, Ordering::Release);
    }

    #[must_use]
    pub fn entity_id(&self) -> EntityId {
        self.entity_id.load(Ordering::Acquire)
    }

    pub fn set_peer_event(&self, callback: PeerEventFn) {
        match self.peer_event.write() {
            Ok(mut slot) => *slot = Some(callback),
            Err(e) => tracing::error!("peer event slot poisoned: {e}"),
        }
    }

    #[must_use]
    pub const fn events(&self) -> &EventHub<PeerNotification> {
        &self.events
    }

    /// Publish a peer event to the hub and the application callback.
    pub fn fire_peer_event(
        &self,
        peer_id: PeerId,
        session: &SessionPtr,
        entity_id: EntityId,
        event: PeerEvent,
        incoming: bool,
    ) {
        tracing::debug!(peer = peer_id, ?event, incoming, "peer event");
        self.events.push(PeerNotification {
            peer_id,
            session_id: session.session_id(),
            entity_id,
            event,
            incoming,
        });
        let callback = self.peer_event.read().ok().and_then(|slot| slot.clone());
        if let Some(callback) = callback {
            callback(peer_id, session, entity_id, event, incoming);
        }
    }

    /// Add a peer unless one with the same address exists.
    ///
    /// For incoming peers `before_fire` runs before the CONNECTED event.
    /// Returns the peer id and whether the peer is new.
    pub fn add_peer(
        &self,
        session: &SessionPtr,
        virtual_session_id: &str,
        entity_id: EntityId,
        entity_name: &str,
        incoming: bool,
        before_fire: Option<&mut dyn FnMut()>,
    ) -> (PeerId, bool) {
        let (peer_id, added) = {
            let mut table = self.lock();
            match table.lookup(
                session.session_id(),
                virtual_session_id,
                entity_id,
                entity_name,
            ) {
                Some(peer_id) => (peer_id, false),
                None => {
                    let peer_id = table.create(Peer {
                        session: Some(session.clone()),
                        virtual_session_id: virtual_session_id.to_owned(),
                        entity_id,
                        entity_name: entity_name.to_owned(),
                        incoming,
                        queued: None,
                    });
                    (peer_id, true)
                }
            }
        };
        if let Some(before_fire) = before_fire {
            before_fire();
        }
        if added && incoming {
            self.fire_peer_event(peer_id, session, entity_id, PeerEvent::Connected, true);
        }
        (peer_id, added)
    }

    /// Add a peer that has no session yet. Requests to it are queued.
    pub fn add_unbound_peer(&self) -> PeerId {
        self.lock().create(Peer {
            session: None,
            virtual_session_id: String::new(),
            entity_id: ENTITYID_INVALID,
            entity_name: String::new(),
            incoming: false,
            queued: Some(Vec::new()),
        })
    }

    /// Bind an unbound peer to a session.
    ///
    /// Returns the requests queued meanwhile, in order, or `None` if the
    /// peer is unknown.
    pub fn connect(
        &self,
        peer_id: PeerId,
        session: &SessionPtr,
        entity_id: EntityId,
        entity_name: &str,
    ) -> Option<Vec<QueuedRequest>> {
        let mut table = self.lock();
        table.unindex_peer(peer_id);
        let peer = table.peers.get_mut(&peer_id)?;
        peer.session = Some(session.clone());
        peer.entity_id = entity_id;
        entity_name.clone_into(&mut peer.entity_name);
        let queued = peer.queued.take().unwrap_or_default();
        table.index_peer(peer_id);
        Some(queued)
    }

    /// Record the identity a handshake reply revealed and fire CONNECTED.
    pub fn update_peer(
        &self,
        peer_id: PeerId,
        virtual_session_id: &str,
        entity_id: EntityId,
        entity_name: &str,
    ) {
        let session = {
            let mut table = self.lock();
            table.unindex_peer(peer_id);
            let Some(peer) = table.peers.get_mut(&peer_id) else {
                return;
            };
            virtual_session_id.clone_into(&mut peer.virtual_session_id);
            peer.entity_id = entity_id;
            if !entity_name.is_empty() {
                entity_name.clone_into(&mut peer.entity_name);
            }
            let session = peer.session.clone();
            table.index_peer(peer_id);
            session
        };
        if let Some(session) = session {
            self.fire_peer_event(peer_id, &session, entity_id, PeerEvent::Connected, false);
        }
    }

    /// Remove a peer. Firing the DISCONNECTED event is left to the caller.
    pub fn remove_peer(&self, peer_id: PeerId) -> Option<RemovedPeer> {
        let mut table = self.lock();
        table.unindex_peer(peer_id);
        let peer = table.peers.remove(&peer_id)?;
        Some(RemovedPeer {
            session: peer.session,
            entity_id: peer.entity_id,
            incoming: peer.incoming,
        })
    }

    /// Build the header of a request to `peer_id`.
    ///
    /// Requests to a peer without a session are queued on the peer.
    pub fn get_request_header(
        &self,
        peer_id: PeerId,
        path: &str,
        body: &StructValue,
        correlation_id: CorrelationId,
        metainfo: Option<&Metainfo>,
    ) -> ReadyToSend {
        let mut table = self.lock();
        let Some(peer) = table.peers.get_mut(&peer_id) else {
            return ReadyToSend::PeerNotAvailable;
        };
        let Some(session) = peer.session.clone() else {
            if let Some(queued) = &mut peer.queued {
                queued.push(QueuedRequest {
                    path: path.to_owned(),
                    body: body.clone(),
                    correlation_id,
                    metainfo: metainfo.cloned().unwrap_or_default(),
                });
            }
            return ReadyToSend::SessionNotAvailable;
        };

        let (destid, destname) = if peer.entity_id == ENTITYID_INVALID {
            (ENTITYID_INVALID, peer.entity_name.clone())
        } else {
            (peer.entity_id, String::new())
        };
        let header = Header {
            destid,
            destname,
            srcid: self.entity_id(),
            mode: MsgMode::Request,
            status: Status::Ok,
            path: path.to_owned(),
            type_name: body.type_name().to_owned(),
            corrid: correlation_id,
            meta: Vec::new(),
        };
        ReadyToSend::Ready {
            header,
            session,
            virtual_session_id: peer.virtual_session_id.clone(),
        }
    }

    /// Peer id for an address, or [`PEERID_INVALID`].
    #[must_use]
    pub fn peer_id(
        &self,
        session_id: SessionId,
        virtual_session_id: &str,
        entity_id: EntityId,
        entity_name: &str,
    ) -> PeerId {
        self.lock()
            .lookup(session_id, virtual_session_id, entity_id, entity_name)
            .unwrap_or(PEERID_INVALID)
    }

    #[must_use]
    pub fn all_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.lock().peers.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    #[must_use]
    pub fn peers_with_session(&self, session_id: SessionId) -> Vec<PeerId> {
        self.collect(|peer| {
            peer.session
                .as_ref()
                .is_some_and(|s| s.session_id() == session_id)
        })
    }

    #[must_use]
    pub fn peers_with_virtual_session(
        &self,
        session_id: SessionId,
        virtual_session_id: &str,
    ) -> Vec<PeerId> {
        self.collect(|peer| {
            peer.virtual_session_id == virtual_session_id
                && peer
                    .session
                    .as_ref()
                    .is_some_and(|s| s.session_id() == session_id)
        })
    }

    fn collect(&self, filter: impl Fn(&Peer) -> bool) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .lock()
            .peers
            .iter()
            .filter(|(_, peer)| filter(peer))
            .map(|(id, _)| *id)
            .collect();
        peers.sort_unstable();
        peers
    }

    #[must_use]
    pub fn session(&self, peer_id: PeerId) -> Option<SessionPtr> {
        self.lock().peers.get(&peer_id)?.session.clone()
    }

    #[must_use]
    pub fn entity_name(&self, peer_id: PeerId) -> Option<String> {
        self.lock()
            .peers
            .get(&peer_id)
            .map(|peer| peer.entity_name.clone())
    }

    #[must_use]
    pub fn peer_entity_id(&self, peer_id: PeerId) -> Option<EntityId> {
        self.lock().peers.get(&peer_id).map(|peer| peer.entity_id)
    }
}
