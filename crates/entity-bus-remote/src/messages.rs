//! Typed message bodies and the dynamic value they travel as.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use entity_bus_core::EntityId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// A message body with a stable wire type name.
pub trait TypedMessage: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_NAME: &'static str;
}

/// Body decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Expected type {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("Invalid body: {0}")]
    Body(#[from] serde_json::Error),
}

/// A message body tagged with its type name.
///
/// Handlers receive bodies in this form and decode them into the type they
/// registered for. A tag mismatch is reported instead of a failed cast.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    type_name: String,
    body: Value,
}

impl StructValue {
    #[must_use]
    pub fn new(type_name: impl Into<String>, body: Value) -> Self {
        Self {
            type_name: type_name.into(),
            body,
        }
    }

    /// Encode a typed message.
    ///
    /// # Errors
    /// Returns error if the message does not serialize to JSON.
    pub fn from_message<M: TypedMessage>(message: &M) -> Result<Self, serde_json::Error> {
        Ok(Self::new(M::TYPE_NAME, serde_json::to_value(message)?))
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    #[must_use]
    pub fn is<M: TypedMessage>(&self) -> bool {
        self.type_name == M::TYPE_NAME
    }

    /// Decode into `M` after checking the type tag.
    ///
    /// # Errors
    /// Returns error on a tag mismatch or a body that does not fit `M`.
    pub fn decode<M: TypedMessage>(&self) -> Result<M, DecodeError> {
        if !self.is::<M>() {
            return Err(DecodeError::TypeMismatch {
                expected: M::TYPE_NAME,
                found: self.type_name.clone(),
            });
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Handshake request naming the entity the sender wants to reach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectEntity {
    pub entity_name: String,
}

impl TypedMessage for ConnectEntity {
    const TYPE_NAME: &'static str = "entitybus.ConnectEntity";
}

/// Handshake reply carrying the id and name of the entity reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectEntityReply {
    pub entity_id: EntityId,
    pub entity_name: String,
}

impl TypedMessage for ConnectEntityReply {
    const TYPE_NAME: &'static str = "entitybus.ConnectEntityReply";
}

/// Event telling the peer that the sender dropped the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectEntity {}

impl TypedMessage for DisconnectEntity {
    const TYPE_NAME: &'static str = "entitybus.DisconnectEntity";
}

/// Opaque payload. Sent as-is when the header travels out of band.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBytes {
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

impl TypedMessage for RawBytes {
    const TYPE_NAME: &'static str = "entitybus.RawBytes";
}

impl RawBytes {
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

mod base64_data {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(D::Error::custom)
    }
}

/// Encode raw bytes as a [`StructValue`].
#[must_use]
pub fn raw_bytes_value(data: &[u8]) -> StructValue {
    StructValue::new(
        RawBytes::TYPE_NAME,
        serde_json::json!({ "data": BASE64.encode(data) }),
    )
}
