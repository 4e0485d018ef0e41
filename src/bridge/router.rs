//! Routing between the broker topics and the devices
//!
//! Pure decisions only: which device an inbound message belongs to, and what
//! a device's state publish looks like. The bridge performs the I/O.

use super::device_state::{Device, DeviceSnapshot};
use crate::config::ConfigError;
use crate::protocol::{parse_set_state, DataPoints, ProtocolError, TopicScheme};
use std::collections::HashMap;

/// Outcome of routing one inbound broker message
#[derive(Debug)]
pub enum InboundDecision {
    /// Forward the command to the device at this index
    Forward { device: usize, command: DataPoints },
    /// Topic is not a command for a known device
    Ignored(IgnoreReason),
    /// Command for a known device with an unusable payload
    Malformed { device: usize, error: ProtocolError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    OutsideRoot,
    UnknownDevice(String),
    NotACommand,
}

/// Retained publish request for one device
#[derive(Debug, Clone, PartialEq)]
pub struct StatePublish {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Maps device names to indices and topics to decisions
#[derive(Debug, Clone)]
pub struct Router {
    scheme: TopicScheme,
    state_topics: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl Router {
    /// Build a router for devices in configuration order; names must be unique
    pub fn new(scheme: TopicScheme, devices: &[Device]) -> Result<Self, ConfigError> {
        let mut by_name = HashMap::with_capacity(devices.len());
        for (index, device) in devices.iter().enumerate() {
            if by_name.insert(device.name.clone(), index).is_some() {
                return Err(ConfigError::DuplicateDeviceName(device.name.clone()));
            }
        }

        let state_topics = devices
            .iter()
            .map(|device| scheme.state_topic(&device.name))
            .collect();

        Ok(Self {
            scheme,
            state_topics,
            by_name,
        })
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Filter covering every device sub-topic
    pub fn subscription_filter(&self) -> String {
        self.scheme.subscription_filter()
    }

    pub fn device_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn state_topic(&self, device: usize) -> Option<&str> {
        self.state_topics.get(device).map(String::as_str)
    }

    /// Decide what to do with a message received under the root
    pub fn route_inbound(&self, topic: &str, payload: &[u8]) -> InboundDecision {
        let Some(inbound) = self.scheme.parse_inbound(topic) else {
            return InboundDecision::Ignored(IgnoreReason::OutsideRoot);
        };

        let Some(device) = self.device_index(inbound.device) else {
            return InboundDecision::Ignored(IgnoreReason::UnknownDevice(
                inbound.device.to_string(),
            ));
        };

        if !inbound.is_set_state() {
            return InboundDecision::Ignored(IgnoreReason::NotACommand);
        }

        match parse_set_state(payload) {
            Ok(command) => InboundDecision::Forward { device, command },
            Err(error) => InboundDecision::Malformed { device, error },
        }
    }

    /// Build the retained state publish for a device
    pub fn state_publish(
        &self,
        device: usize,
        snapshot: &DeviceSnapshot,
        timestamp: i64,
    ) -> Option<Result<StatePublish, ProtocolError>> {
        let topic = self.state_topic(device)?;
        Some(
            snapshot
                .to_payload(timestamp)
                .to_json_bytes()
                .map(|payload| StatePublish {
                    topic: topic.to_string(),
                    payload,
                }),
        )
    }
}
