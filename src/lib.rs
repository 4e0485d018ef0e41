//! tuya2mqtt - device state bridge
//!
//! Keeps the retained MQTT view of a set of locally connected smart devices
//! eventually consistent with the devices' live state, and routes commands
//! published on the broker back to the matching device.
//!
//! # Overview
//!
//! - [`bridge`] - link lifecycle tracking, per-device state merge, routing
//!   and periodic reconciliation, driven by a single event loop
//! - [`protocol`] - topic scheme and JSON payload shapes
//! - [`transport`] - broker and device collaborator traits plus the MQTT and
//!   TCP implementations
//! - [`config`] - TOML configuration with validation
//!
//! # Quick Start
//!
//! ```rust
//! use tuya2mqtt::bridge::{DeviceStateStore, LinkSignal, LinkState, LinkTracker};
//! use tuya2mqtt::protocol::DataPoints;
//! use serde_json::json;
//!
//! let mut tracker = LinkTracker::new("mqtt");
//! assert_eq!(tracker.apply(LinkSignal::Connect), Some(LinkState::Connected));
//!
//! let mut store = DeviceStateStore::new();
//! let mut partial = DataPoints::new();
//! partial.insert("1".to_string(), json!(true));
//! store.apply_data(&partial);
//! assert!(store.snapshot().connected);
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
