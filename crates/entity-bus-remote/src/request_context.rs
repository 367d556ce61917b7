//! Per-request reply handle.
//!
//! A [`RequestContext`] answers exactly one request. The first reply wins and
//! later ones are ignored. A context dropped without a reply answers with
//! [`Status::NoReply`], or [`Status::RequestProcessingError`] when it is
//! dropped by a panicking handler.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use entity_bus_core::{
    ControlData, CorrelationId, EchoData, EntityId, Header, Metainfo, PEERID_INVALID, PeerId,
    Status,
};
use entity_bus_session::SessionPtr;

use crate::{
    format::{FormatRegistry, Outgoing, ParsedMessage, encode},
    messages::{RawBytes, StructValue, TypedMessage},
    peer::PeerManager,
};

/// An inbound message together with the session it arrived on.
#[derive(Clone)]
pub struct ReceiveData {
    pub session: SessionPtr,
    pub virtual_session_id: String,
    pub header: Header,
    pub body: Option<StructValue>,
    pub metainfo: Metainfo,
    pub echo_data: EchoData,
    /// The undecoded payload, kept when the container is configured to.
    pub raw_data: Option<Bytes>,
}

impl ReceiveData {
    #[must_use]
    pub fn new(session: SessionPtr, parsed: ParsedMessage) -> Self {
        Self {
            session,
            virtual_session_id: parsed.virtual_session_id,
            header: parsed.header,
            body: parsed.body,
            metainfo: parsed.metainfo,
            echo_data: parsed.echo_data,
            raw_data: None,
        }
    }
}

pub struct RequestContext {
    peer_manager: Arc<PeerManager>,
    formats: Arc<FormatRegistry>,
    session: SessionPtr,
    virtual_session_id: String,
    requester_id: EntityId,
    entity_id: EntityId,
    correlation_id: CorrelationId,
    metainfo: Metainfo,
    echo_data: EchoData,
    raw_data: Option<Bytes>,
    peer_id: OnceLock<PeerId>,
    replied: bool,
    delayed: bool,
}

impl RequestContext {
    /// Context for a request received by entity `entity_id`.
    #[must_use]
    pub fn new(
        peer_manager: Arc<PeerManager>,
        formats: Arc<FormatRegistry>,
        entity_id: EntityId,
        received: &ReceiveData,
    ) -> Self {
        Self {
            peer_manager,
            formats,
            session: received.session.clone(),
            virtual_session_id: received.virtual_session_id.clone(),
            requester_id: received.header.srcid,
            entity_id,
            correlation_id: received.header.corrid,
            metainfo: received.metainfo.clone(),
            echo_data: received.echo_data.clone(),
            raw_data: received.raw_data.clone(),
            peer_id: OnceLock::new(),
            replied: false,
            delayed: false,
        }
    }

    fn send_reply(
        &mut self,
        status: Status,
        body: Option<&StructValue>,
        metainfo: Option<Metainfo>,
        control_data: Option<ControlData>,
    ) {
        if self.replied {
            return;
        }
        self.replied = true;

        let type_name = body.map(|b| b.type_name().to_owned()).unwrap_or_default();
        let header = Header::reply(
            self.requester_id,
            self.entity_id,
            status,
            type_name,
            self.correlation_id,
        );
        let outgoing = Outgoing {
            virtual_session_id: &self.virtual_session_id,
            echo_data: self.echo_data.clone(),
            metainfo: metainfo.unwrap_or_default(),
            control_data,
            ..Outgoing::new(header, body)
        };
        match self.formats.send(&self.session, outgoing) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                session = self.session.session_id(),
                "reply {} not accepted by protocol",
                self.correlation_id
            ),
            Err(e) => tracing::error!("failed to send reply: {e}"),
        }
    }

    /// Reply with a typed message.
    pub fn reply<R: TypedMessage>(&mut self, reply: &R) {
        self.reply_meta(reply, Metainfo::new());
    }

    pub fn reply_meta<R: TypedMessage>(&mut self, reply: &R, metainfo: Metainfo) {
        match encode(reply) {
            Some(value) => self.send_reply(Status::Ok, Some(&value), Some(metainfo), None),
            None => self.send_reply(Status::RequestProcessingError, None, None, None),
        }
    }

    /// Reply with an already encoded body.
    pub fn reply_value(&mut self, reply: &StructValue, metainfo: Option<Metainfo>) {
        self.send_reply(Status::Ok, Some(reply), metainfo, None);
    }

    /// Reply with a status and no body.
    pub fn reply_status(&mut self, status: Status) {
        self.send_reply(status, None, None, None);
    }

    /// Reply with protocol control data and no body.
    pub fn reply_control(&mut self, control_data: ControlData, metainfo: Option<Metainfo>) {
        self.send_reply(Status::Ok, None, metainfo, Some(control_data));
    }

    /// Reply with raw bytes. They go out unframed when the protocol carries
    /// the header as metainfo.
    pub fn reply_memory(&mut self, data: impl Into<Vec<u8>>, metainfo: Option<Metainfo>) {
        match encode(&RawBytes::new(data)) {
            Some(value) => self.send_reply(Status::Ok, Some(&value), metainfo, None),
            None => self.send_reply(Status::RequestProcessingError, None, None, None),
        }
    }

    /// Mark the reply as coming later, from wherever the context is moved to.
    #[must_use]
    pub fn delay_reply(mut self) -> Self {
        self.delayed = true;
        self
    }

    #[must_use]
    pub const fn is_delayed_reply(&self) -> bool {
        self.delayed
    }

    #[must_use]
    pub const fn has_replied(&self) -> bool {
        self.replied
    }

    /// Peer the request came from, resolved on first use.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        if let Some(peer_id) = self.peer_id.get() {
            return *peer_id;
        }
        let peer_id = self.peer_manager.peer_id(
            self.session.session_id(),
            &self.virtual_session_id,
            self.requester_id,
            "",
        );
        if peer_id != PEERID_INVALID {
            let _ = self.peer_id.set(peer_id);
        }
        peer_id
    }

    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Entity id of the requester.
    #[must_use]
    pub const fn entity_id(&self) -> EntityId {
        self.requester_id
    }

    #[must_use]
    pub fn metainfo(&self, key: &str) -> Option<&str> {
        self.metainfo.get(key).map(String::as_str)
    }

    #[must_use]
    pub const fn all_metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    /// Undecoded request payload, if the container keeps it.
    #[must_use]
    pub const fn raw_data(&self) -> Option<&Bytes> {
        self.raw_data.as_ref()
    }

    #[must_use]
    pub fn virtual_session_id(&self) -> &str {
        &self.virtual_session_id
    }

    #[must_use]
    pub const fn session(&self) -> &SessionPtr {
        &self.session
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.replied {
            return;
        }
        let status = if std::thread::panicking() {
            Status::RequestProcessingError
        } else {
            Status::NoReply
        };
        self.send_reply(status, None, None, None);
    }
}
