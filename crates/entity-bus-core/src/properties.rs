//! Connect and bind properties.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol data key: upper bound of pooled request connections.
pub const MAX_REQUEST_CONNECTIONS: &str = "max_request_connections";

/// Protocol data key: idle time in milliseconds before an incoming session is dropped.
pub const ACTIVITY_TIMEOUT: &str = "activity_timeout";

/// Protocol data key: buffered poll messages tolerated before disconnecting.
pub const POLL_MAX_REQUESTS: &str = "poll_max_requests";

pub const DEFAULT_MAX_REQUEST_CONNECTIONS: usize = 6;
pub const DEFAULT_POLL_MAX_REQUESTS: i64 = 10_000;

/// Arbitrary protocol settings, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolData(HashMap<String, Value>);

impl ProtocolData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Integer setting. Numeric strings are accepted.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Configured request pool size, at least one.
    #[must_use]
    pub fn max_request_connections(&self) -> usize {
        self.get_i64(MAX_REQUEST_CONNECTIONS)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_REQUEST_CONNECTIONS)
    }
}

/// Properties for an outgoing connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectProperties {
    #[serde(default)]
    pub protocol_data: ProtocolData,

    /// Retry interval in milliseconds, owned by the transport.
    #[serde(default)]
    pub reconnect_interval: Option<u64>,

    /// Give up reconnecting after this many milliseconds.
    #[serde(default)]
    pub total_reconnect_duration: Option<u64>,
}

impl ConnectProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_protocol_data(protocol_data: ProtocolData) -> Self {
        Self {
            protocol_data,
            ..Self::default()
        }
    }
}

/// Properties for a listening endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindProperties {
    #[serde(default)]
    pub protocol_data: ProtocolData,
}

impl BindProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_protocol_data(protocol_data: ProtocolData) -> Self {
        Self { protocol_data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_request_connections_default() {
        assert_eq!(
            ProtocolData::new().max_request_connections(),
            DEFAULT_MAX_REQUEST_CONNECTIONS
        );
        let data = ProtocolData::new().with(MAX_REQUEST_CONNECTIONS, 0);
        assert_eq!(data.max_request_connections(), DEFAULT_MAX_REQUEST_CONNECTIONS);
    }

    #[test]
    fn test_get_i64_accepts_strings() {
        let data = ProtocolData::new()
            .with(ACTIVITY_TIMEOUT, "1500")
            .with(MAX_REQUEST_CONNECTIONS, 2);
        assert_eq!(data.get_i64(ACTIVITY_TIMEOUT), Some(1500));
        assert_eq!(data.max_request_connections(), 2);
    }

    #[test]
    fn test_properties_deserialize_with_defaults() {
        let props: ConnectProperties =
            serde_json::from_str(r#"{"protocol_data":{"poll_max_requests":5}}"#).unwrap();
        assert_eq!(props.protocol_data.get_i64(POLL_MAX_REQUESTS), Some(5));
        assert!(props.reconnect_interval.is_none());
    }
}
