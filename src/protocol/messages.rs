//! Payload types exchanged with the broker
//!
//! The retained state payload is a single flat JSON object: the device's data
//! points at the top level next to `connected` and `timestamp`.
//!
//! ```json
//! {
//!     "1": true,
//!     "20": 850,
//!     "connected": true,
//!     "timestamp": 1718000000000
//! }
//! ```

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Data-point map keyed by the device's data-point identifier
///
/// Tuya devices use small integers ("1", "20") while some report string
/// codes; both arrive as JSON object keys.
pub type DataPoints = BTreeMap<String, Value>;

/// Reserved key carrying the device connectivity flag
pub const CONNECTED_KEY: &str = "connected";

/// Reserved key carrying the capture time in epoch milliseconds
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Retained state message published for one device
#[derive(Debug, Clone, PartialEq)]
pub struct StatePayload {
    pub connected: bool,
    pub data_points: DataPoints,
    /// Capture time, epoch milliseconds
    pub timestamp: i64,
}

impl StatePayload {
    pub fn new(connected: bool, data_points: DataPoints, timestamp: i64) -> Self {
        Self {
            connected,
            data_points,
            timestamp,
        }
    }

    /// Build the flat JSON object.
    ///
    /// `connected` and `timestamp` always win over data points that happen to
    /// use the same keys.
    pub fn to_value(&self) -> Value {
        let mut object: Map<String, Value> = self
            .data_points
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        object.insert(CONNECTED_KEY.to_string(), Value::Bool(self.connected));
        object.insert(TIMESTAMP_KEY.to_string(), Value::from(self.timestamp));
        Value::Object(object)
    }

    /// Serialize as 4-space indented JSON
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buffer = Vec::with_capacity(128);
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.to_value()
            .serialize(&mut serializer)
            .map_err(ProtocolError::Serialization)?;
        Ok(buffer)
    }

    /// Parse a published state payload back into its parts
    pub fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut object = parse_object(payload)?;

        let connected = object
            .remove(CONNECTED_KEY)
            .and_then(|v| v.as_bool())
            .ok_or(ProtocolError::MissingField(CONNECTED_KEY))?;
        let timestamp = object
            .remove(TIMESTAMP_KEY)
            .and_then(|v| v.as_i64())
            .ok_or(ProtocolError::MissingField(TIMESTAMP_KEY))?;

        Ok(Self {
            connected,
            data_points: object.into_iter().collect(),
            timestamp,
        })
    }
}

/// Parse an inbound `set-state` payload into a data-point command.
///
/// The payload must be a JSON object; its entries are forwarded to the device
/// unmodified.
pub fn parse_set_state(payload: &[u8]) -> Result<DataPoints, ProtocolError> {
    Ok(parse_object(payload)?.into_iter().collect())
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::from_slice::<Value>(payload).map_err(ProtocolError::InvalidJson)? {
        Value::Object(object) => Ok(object),
        other => Err(ProtocolError::NotAnObject(json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Payload encoding and decoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("Payload is missing field '{0}'")]
    MissingField(&'static str),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}
