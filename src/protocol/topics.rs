//! Topic scheme and device name validation
//!
//! All bridge traffic lives under a single configured root:
//!
//! - `ROOT/<device>/state` - retained device snapshot (outbound)
//! - `ROOT/<device>/set-state` - data-point command (inbound)
//! - `ROOT/#` - the single subscription covering every inbound topic

use thiserror::Error;

/// Suffix of the retained per-device state topic
pub const STATE_SUFFIX: &str = "state";

/// Suffix of the inbound command topic
pub const SET_STATE_SUFFIX: &str = "set-state";

/// Topic layout rooted at the configured topic root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    root: String,
}

/// Inbound topic split into its routing parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundTopic<'a> {
    pub device: &'a str,
    pub suffix: &'a str,
}

impl InboundTopic<'_> {
    /// True when the topic addresses the command channel of a device
    pub fn is_set_state(&self) -> bool {
        self.suffix == SET_STATE_SUFFIX
    }
}

impl TopicScheme {
    /// Build a scheme for `root`, dropping any trailing slashes
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `ROOT/<device>/state`
    pub fn state_topic(&self, device: &str) -> String {
        format!("{}/{device}/{STATE_SUFFIX}", self.root)
    }

    /// `ROOT/#`
    pub fn subscription_filter(&self) -> String {
        format!("{}/#", self.root)
    }

    /// Strip `ROOT/` from a topic, yielding the routing key `<device>/<suffix>`
    pub fn routing_key<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Split an inbound topic into device name and suffix.
    ///
    /// Returns `None` for topics outside the root or without a suffix.
    pub fn parse_inbound<'a>(&self, topic: &'a str) -> Option<InboundTopic<'a>> {
        let key = self.routing_key(topic)?;
        let (device, suffix) = key.split_once('/')?;
        if device.is_empty() {
            return None;
        }
        Some(InboundTopic { device, suffix })
    }
}

/// Validate that a device name can be used as a single topic segment
pub fn validate_device_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyDeviceName);
    }

    for ch in name.chars() {
        if matches!(ch, '/' | '+' | '#' | '\0') {
            return Err(ValidationError::InvalidDeviceNameChar(ch));
        }
    }

    Ok(())
}

/// Validate the configured topic root
pub fn validate_topic_root(root: &str) -> Result<(), ValidationError> {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyTopicRoot);
    }
    if trimmed.contains(['+', '#']) {
        return Err(ValidationError::WildcardInTopicRoot(root.to_string()));
    }
    Ok(())
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device name cannot be empty")]
    EmptyDeviceName,
    #[error("Device name contains invalid character: '{0}'")]
    InvalidDeviceNameChar(char),
    #[error("Topic root cannot be empty")]
    EmptyTopicRoot,
    #[error("Topic root must not contain wildcards: {0}")]
    WildcardInTopicRoot(String),
}
