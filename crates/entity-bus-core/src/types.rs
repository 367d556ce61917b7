//! Identifiers, status codes and event kinds shared by every layer.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Entity identifier, assigned by a container at registration.
pub type EntityId = u64;

/// Peer identifier, unique within one entity's peer manager.
pub type PeerId = u64;

/// Correlation identifier pairing a request with its reply.
pub type CorrelationId = u64;

/// Session identifier, unique within one session manager.
pub type SessionId = i64;

/// Transport connection identifier.
pub type ConnectionId = i64;

/// Address the default entity of a container.
pub const ENTITYID_DEFAULT: EntityId = 0;

/// Marks an unknown entity id. Lookups fall back to the entity name.
pub const ENTITYID_INVALID: EntityId = 0x7fff_ffff_ffff_ffff;

/// Never handed out by a peer manager.
pub const PEERID_INVALID: PeerId = 0;

/// Used by events, which expect no reply.
pub const CORRELATIONID_NONE: CorrelationId = 0;

/// String key/value metadata carried next to a message.
pub type Metainfo = HashMap<String, String>;

/// Local routing data attached to a message. Never serialized on the wire.
pub type EchoData = Map<String, Value>;

/// Protocol-specific control values (poll stop markers, virtual sessions).
pub type ControlData = Map<String, Value>;

/// Reply status. The integer values are visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Status {
    #[default]
    Ok = 0,
    EntityNotFound = 1,
    WrongReplyType = 2,
    SyntaxError = 3,
    RequestNotFound = 4,
    RequestTypeNotKnown = 5,
    ReplyTypeNotKnown = 6,
    SessionDisconnected = 7,
    PeerDisconnected = 8,
    NoReply = 9,
    WrongContentType = 10,
    /// A request handler panicked before replying.
    RequestProcessingError = 11,
}

impl Status {
    const ALL: [Self; 12] = [
        Self::Ok,
        Self::EntityNotFound,
        Self::WrongReplyType,
        Self::SyntaxError,
        Self::RequestNotFound,
        Self::RequestTypeNotKnown,
        Self::ReplyTypeNotKnown,
        Self::SessionDisconnected,
        Self::PeerDisconnected,
        Self::NoReply,
        Self::WrongContentType,
        Self::RequestProcessingError,
    ];

    /// Wire name, as used in metainfo headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "STATUS_OK",
            Self::EntityNotFound => "STATUS_ENTITY_NOT_FOUND",
            Self::WrongReplyType => "STATUS_WRONG_REPLY_TYPE",
            Self::SyntaxError => "STATUS_SYNTAX_ERROR",
            Self::RequestNotFound => "STATUS_REQUEST_NOT_FOUND",
            Self::RequestTypeNotKnown => "STATUS_REQUESTTYPE_NOT_KNOWN",
            Self::ReplyTypeNotKnown => "STATUS_REPLYTYPE_NOT_KNOWN",
            Self::SessionDisconnected => "STATUS_SESSION_DISCONNECTED",
            Self::PeerDisconnected => "STATUS_PEER_DISCONNECTED",
            Self::NoReply => "STATUS_NO_REPLY",
            Self::WrongContentType => "STATUS_WRONG_CONTENTTYPE",
            Self::RequestProcessingError => "STATUS_REQUEST_PROCESSING_ERROR",
        }
    }

    /// Parse either the wire name or the decimal code.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(code) = s.parse::<i32>() {
            return Self::try_from(code).ok();
        }
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        status as Self
    }
}

/// Unknown status code.
#[derive(Debug, Error)]
#[error("Unknown status code: {0}")]
pub struct UnknownStatus(pub i32);

impl TryFrom<i32> for Status {
    type Error = UnknownStatus;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|status| i32::from(*status) == code)
            .ok_or(UnknownStatus(code))
    }
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MsgMode {
    #[default]
    #[serde(rename = "MSG_REQUEST")]
    Request,
    #[serde(rename = "MSG_REPLY")]
    Reply,
}

impl MsgMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "MSG_REQUEST",
            Self::Reply => "MSG_REPLY",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MSG_REQUEST" | "0" => Some(Self::Request),
            "MSG_REPLY" | "1" => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Peer lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerEvent {
    Connected,
    Disconnected,
}

/// Session lifecycle event, as reported by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    SocketConnected,
    SocketDisconnected,
}
