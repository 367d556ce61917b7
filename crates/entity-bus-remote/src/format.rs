//! Content types and the registry that frames entity messages.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use entity_bus_core::{
    CORRELATIONID_NONE, ControlData, EchoData, Header, Metainfo, MsgMode, ProtocolMessage,
    header::keys, message::CONTROL_VIRTUAL_SESSION_ID,
};
use entity_bus_session::{ProtocolSession, SessionPtr};
use serde_json::Value;
use thiserror::Error;

use crate::{
    json::JsonFormat,
    messages::{RawBytes, StructValue, TypedMessage},
};

pub const CONTENT_TYPE_PROTO: i32 = 1;
pub const CONTENT_TYPE_JSON: i32 = 2;
pub const CONTENT_TYPE_HL7: i32 = 3;

/// Format error.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Unknown content type: {0}")]
    UnknownContentType(i32),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes and decodes entity messages for one content type.
pub trait Format: Send + Sync {
    fn content_type(&self) -> i32;

    fn name(&self) -> &'static str;

    /// Header and body in one payload.
    ///
    /// # Errors
    /// Returns error if the header or body does not serialize.
    fn serialize(&self, header: &Header, body: Option<&StructValue>) -> Result<Bytes, FormatError>;

    /// Body only, for protocols that carry the header as metainfo.
    ///
    /// # Errors
    /// Returns error if the body does not serialize.
    fn serialize_data(&self, body: Option<&StructValue>) -> Result<Bytes, FormatError>;

    /// # Errors
    /// Returns error on malformed input.
    fn parse(&self, payload: &[u8]) -> Result<(Header, Option<StructValue>), FormatError>;

    /// # Errors
    /// Returns error on malformed input.
    fn parse_data(&self, payload: &[u8], type_name: &str) -> Result<Option<StructValue>, FormatError>;
}

/// Flags raised while parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatStatus {
    /// The sender never handshaked. Its peer is created on the fly.
    pub automatic_connect: bool,
    pub syntax_error: bool,
}

/// An inbound entity message.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub header: Header,
    pub body: Option<StructValue>,
    pub metainfo: Metainfo,
    pub echo_data: EchoData,
    pub virtual_session_id: String,
    pub status: FormatStatus,
}

/// Everything needed to send one entity message.
pub struct Outgoing<'a> {
    pub header: Header,
    pub body: Option<&'a StructValue>,
    pub virtual_session_id: &'a str,
    pub echo_data: EchoData,
    pub metainfo: Metainfo,
    pub control_data: Option<ControlData>,
}

impl<'a> Outgoing<'a> {
    #[must_use]
    pub fn new(header: Header, body: Option<&'a StructValue>) -> Self {
        Self {
            header,
            body,
            virtual_session_id: "",
            echo_data: EchoData::new(),
            metainfo: Metainfo::new(),
            control_data: None,
        }
    }
}

/// Formats by content type, owned by a container.
pub struct FormatRegistry {
    formats: RwLock<HashMap<i32, Arc<dyn Format>>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn raw_payload(body: Option<&StructValue>) -> Option<Bytes> {
    let body = body.filter(|b| b.is::<RawBytes>())?;
    body.decode::<RawBytes>().ok().map(|raw| Bytes::from(raw.data))
}

impl FormatRegistry {
    /// Registry with the JSON format installed.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            formats: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(JsonFormat));
        registry
    }

    pub fn register(&self, format: Arc<dyn Format>) {
        match self.formats.write() {
            Ok(mut formats) => {
                formats.insert(format.content_type(), format);
            }
            Err(e) => tracing::error!("format registry poisoned: {e}"),
        }
    }

    #[must_use]
    pub fn get(&self, content_type: i32) -> Option<Arc<dyn Format>> {
        self.formats.read().ok()?.get(&content_type).cloned()
    }

    /// Content type registered under `name`, such as `json`.
    #[must_use]
    pub fn content_type_by_name(&self, name: &str) -> Option<i32> {
        self.formats
            .read()
            .ok()?
            .values()
            .find(|format| format.name() == name)
            .map(|format| format.content_type())
    }

    /// Replies without correlation id are dropped unless the protocol needs a reply.
    #[must_use]
    pub fn shall_send(header: &Header, session: &ProtocolSession) -> bool {
        header.mode != MsgMode::Reply
            || header.corrid != CORRELATIONID_NONE
            || session.capabilities().needs_reply
    }

    /// Frame and send one message on `session`.
    ///
    /// Returns whether the session accepted it.
    ///
    /// # Errors
    /// Returns error if the session's content type is unknown or the body
    /// does not serialize.
    pub fn send(&self, session: &SessionPtr, outgoing: Outgoing<'_>) -> Result<bool, FormatError> {
        let Outgoing {
            mut header,
            body,
            virtual_session_id,
            echo_data,
            metainfo,
            control_data,
        } = outgoing;

        if !Self::shall_send(&header, session) {
            return Ok(true);
        }
        let format = self
            .get(session.content_type())
            .ok_or(FormatError::UnknownContentType(session.content_type()))?;

        let mut message = session.create_message();
        if session.capabilities().supports_metainfo {
            let mut metainfo = metainfo;
            header.write_metainfo(&mut metainfo);
            let payload = match raw_payload(body) {
                Some(raw) => raw,
                None => format.serialize_data(body)?,
            };
            message.add_send_payload(payload);
            *message.metainfo_mut() = metainfo;
        } else {
            header.fold_metainfo(&metainfo);
            message.add_send_payload(format.serialize(&header, body)?);
        }

        *message.echo_data_mut() = echo_data;
        if let Some(control_data) = control_data {
            *message.control_data_mut() = control_data;
        }
        if !virtual_session_id.is_empty() {
            message.control_data_mut().insert(
                CONTROL_VIRTUAL_SESSION_ID.into(),
                Value::String(virtual_session_id.to_owned()),
            );
        }

        Ok(session.send_message(Arc::new(message), header.mode == MsgMode::Reply))
    }

    /// Decode an inbound message received on `session`.
    #[must_use]
    pub fn parse(&self, session: &ProtocolSession, message: &ProtocolMessage) -> ParsedMessage {
        let mut parsed = ParsedMessage {
            metainfo: message.metainfo().clone(),
            echo_data: message.echo_data().clone(),
            ..ParsedMessage::default()
        };

        let payload = if message.receive_payload().is_empty() {
            message.joined_send_payload()
        } else {
            message.receive_payload().clone()
        };

        let Some(format) = self.get(session.content_type()) else {
            tracing::warn!("no format for content type {}", session.content_type());
            parsed.status.syntax_error = true;
            return parsed;
        };

        if session.capabilities().supports_metainfo {
            let (header, has_source) = Header::read_metainfo(&parsed.metainfo);
            parsed.status.automatic_connect = !has_source && header.mode == MsgMode::Request;
            parsed.body = if header.type_name == RawBytes::TYPE_NAME {
                Some(crate::messages::raw_bytes_value(&payload))
            } else {
                match format.parse_data(&payload, &header.type_name) {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::debug!("malformed body: {e}");
                        parsed.status.syntax_error = true;
                        None
                    }
                }
            };
            parsed.header = header;
        } else {
            match format.parse(&payload) {
                Ok((mut header, body)) => {
                    parsed.metainfo.extend(header.take_metainfo());
                    parsed.header = header;
                    parsed.body = body;
                }
                Err(e) => {
                    tracing::debug!("malformed message: {e}");
                    parsed.status.syntax_error = true;
                }
            }
        }

        if parsed.header.path.is_empty() {
            parsed.header.path.clone_from(&parsed.header.type_name);
        }

        parsed.virtual_session_id = message
            .control_data()
            .get(CONTROL_VIRTUAL_SESSION_ID)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| parsed.metainfo.get(keys::VIRTUAL_SESSION_ID).cloned())
            .unwrap_or_default();

        parsed
    }

    /// Decode the payload of a metainfo-mode message as `type_name`.
    ///
    /// Used when the sender left the type out and the receiver knows it from
    /// the command path.
    ///
    /// # Errors
    /// Returns error if the content type is unknown or the payload is malformed.
    pub fn parse_body(
        &self,
        session: &ProtocolSession,
        message: &ProtocolMessage,
        type_name: &str,
    ) -> Result<Option<StructValue>, FormatError> {
        let format = self
            .get(session.content_type())
            .ok_or(FormatError::UnknownContentType(session.content_type()))?;
        let payload = if message.receive_payload().is_empty() {
            message.joined_send_payload()
        } else {
            message.receive_payload().clone()
        };
        if type_name == RawBytes::TYPE_NAME {
            return Ok(Some(crate::messages::raw_bytes_value(&payload)));
        }
        format.parse_data(&payload, type_name)
    }
}

/// Encode a typed message, logging failures.
pub(crate) fn encode<M: TypedMessage>(message: &M) -> Option<StructValue> {
    match StructValue::from_message(message) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("failed to encode {}: {e}", M::TYPE_NAME);
            None
        }
    }
}
