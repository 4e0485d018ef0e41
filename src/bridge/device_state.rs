//! Per-device identity and merged state

use crate::protocol::{DataPoints, StatePayload};
use serde::Serialize;

/// Device identity, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Unique name, used as topic segment and routing key
    pub name: String,
    pub id: String,
    #[serde(skip_serializing)]
    pub key: String,
    /// `host` or `host:port`
    pub address: String,
    pub version: String,
}

/// Point-in-time copy of a device's state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    pub connected: bool,
    pub data_points: DataPoints,
}

impl DeviceSnapshot {
    /// Payload for publishing, stamped with `timestamp` (epoch millis)
    pub fn to_payload(&self, timestamp: i64) -> StatePayload {
        StatePayload::new(self.connected, self.data_points.clone(), timestamp)
    }
}

/// Merged state of one device.
///
/// Data points only ever grow or get overwritten; a disconnect clears the
/// connectivity flag but keeps the last known values.
#[derive(Debug, Default)]
pub struct DeviceStateStore {
    current: DeviceSnapshot,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_connected(&mut self) {
        self.current.connected = true;
    }

    /// Last-write-wins merge of `partial`; also marks the device connected
    pub fn apply_data(&mut self, partial: &DataPoints) {
        self.current.connected = true;
        for (key, value) in partial {
            self.current.data_points.insert(key.clone(), value.clone());
        }
    }

    pub fn apply_disconnected(&mut self) {
        self.current.connected = false;
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.current.clone()
    }
}
