//! Configuration for the bridge
//!
//! Loaded from a TOML file. Secrets (MQTT credentials, device keys) are
//! referenced by environment variable name and resolved at runtime; a device
//! key may also be given inline.
//!
//! ```toml
//! [mqtt]
//! broker_url = "mqtt://localhost:1883"
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//! password_encoding = "base64"
//!
//! [bridge]
//! topic_root = "tuya"
//! reconcile_interval_secs = 15
//!
//! [[devices]]
//! name = "lamp1"
//! id = "bf0123456789abcdef"
//! key_env = "LAMP1_KEY"
//! address = "192.168.1.50"
//! version = "3.3"
//! ```

use base64::Engine;
use crate::bridge::Device;
use crate::protocol::{validate_device_name, validate_topic_root, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    /// Ordered device list; order is kept for publishing and logging
    #[serde(default)]
    pub devices: Vec<DeviceSection>,
}

/// MQTT broker connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port (`mqtt://` or `mqtts://`)
    pub broker_url: String,
    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// How the password variable is encoded
    #[serde(default)]
    pub password_encoding: SecretEncoding,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Optional transport security material
    pub tls: Option<TlsSection>,
}

/// TLS material for `mqtts://` brokers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    /// PEM CA certificate used to verify the broker
    pub ca_file: PathBuf,
    /// PEM client certificate (requires `key_file`)
    pub cert_file: Option<PathBuf>,
    /// PEM client private key (requires `cert_file`)
    pub key_file: Option<PathBuf>,
}

/// Bridge behaviour settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Root topic every device topic lives under
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    /// Seconds between reconciliation ticks
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            topic_root: default_topic_root(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

/// One configured device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Unique name, used as topic segment and routing key
    pub name: String,
    /// Device identifier
    pub id: String,
    /// Inline local key
    pub key: Option<String>,
    /// Environment variable containing the local key
    pub key_env: Option<String>,
    /// How the key (inline or from `key_env`) is encoded
    #[serde(default)]
    pub key_encoding: SecretEncoding,
    /// Network address, `host` or `host:port`
    pub address: String,
    /// Protocol version reported by the device
    #[serde(default = "default_protocol_version")]
    pub version: String,
}

/// Encoding of a secret value
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecretEncoding {
    #[default]
    Plain,
    Base64,
}

impl SecretEncoding {
    /// Decode `value`; `what` names the secret in errors
    pub fn decode(self, what: &str, value: String) -> Result<String, ConfigError> {
        match self {
            SecretEncoding::Plain => Ok(value),
            SecretEncoding::Base64 => {
                let invalid = |reason: String| ConfigError::InvalidSecret {
                    what: what.to_string(),
                    reason,
                };
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(value.trim())
                    .map_err(|e| invalid(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
            }
        }
    }
}

fn default_client_id() -> String {
    "tuya2mqtt".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_topic_root() -> String {
    "tuya".to_string()
}

fn default_reconcile_interval() -> u64 {
    15
}

fn default_protocol_version() -> String {
    "3.3".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Duplicate device name: {0}")]
    DuplicateDeviceName(String),
    #[error("Invalid device name '{name}': {source}")]
    InvalidDeviceName {
        name: String,
        #[source]
        source: ValidationError,
    },
    #[error("Invalid topic root: {0}")]
    InvalidTopicRoot(#[source] ValidationError),
    #[error("Device '{0}' has no key; set `key` or `key_env`")]
    MissingDeviceKey(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Cannot decode {what}: {reason}")]
    InvalidSecret { what: String, reason: String },
}

impl BridgeConfig {
    /// Load configuration from TOML file and validate it.
    ///
    /// Relative TLS file paths are resolved against the config file's directory.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;

        if let Some(base) = path.parent() {
            config.resolve_relative_paths(base);
        }

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the bridge relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic_root(&self.bridge.topic_root).map_err(ConfigError::InvalidTopicRoot)?;

        if self.bridge.reconcile_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconcile_interval_secs must be greater than 0".to_string(),
            ));
        }

        let scheme = self.mqtt.broker_url.split("://").next().unwrap_or_default();
        if !self.mqtt.broker_url.contains("://") || !matches!(scheme, "mqtt" | "mqtts") {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_url must use mqtt:// or mqtts://, got '{}'",
                self.mqtt.broker_url
            )));
        }

        if let Some(tls) = &self.mqtt.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "tls.cert_file and tls.key_file must be set together".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            validate_device_name(&device.name).map_err(|source| {
                ConfigError::InvalidDeviceName {
                    name: device.name.clone(),
                    source,
                }
            })?;
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDeviceName(device.name.clone()));
            }
            if device.key.is_none() && device.key_env.is_none() {
                return Err(ConfigError::MissingDeviceKey(device.name.clone()));
            }
        }

        Ok(())
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        if let Some(tls) = self.mqtt.tls.as_mut() {
            let join = |p: &mut PathBuf| {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            };
            join(&mut tls.ca_file);
            if let Some(cert) = tls.cert_file.as_mut() {
                join(cert);
            }
            if let Some(key) = tls.key_file.as_mut() {
                join(key);
            }
        }
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable, decoded per `password_encoding`
    pub fn get_mqtt_password(&self) -> Result<Option<String>, ConfigError> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
            .map(|password| self.mqtt.password_encoding.decode("MQTT password", password))
            .transpose()
    }

    /// Interval between reconciliation ticks
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.reconcile_interval_secs)
    }

    /// Build device identities in configuration order, resolving keys
    pub fn device_identities(&self) -> Result<Vec<Device>, ConfigError> {
        self.devices.iter().map(DeviceSection::to_device).collect()
    }

    /// Copy of the configuration with inline secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for device in &mut config.devices {
            if device.key.is_some() {
                device.key = Some("***".to_string());
            }
        }
        config
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[bridge]
topic_root = "tuya"

[[devices]]
name = "lamp1"
id = "device-1"
key = "0123456789abcdef"
address = "192.168.1.50"

[[devices]]
name = "lamp2"
id = "device-2"
key = "fedcba9876543210"
address = "192.168.1.51:6668"
version = "3.4"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

impl DeviceSection {
    /// Resolve the local key, preferring the inline value
    pub fn resolve_key(&self) -> Result<String, ConfigError> {
        let raw = match (&self.key, &self.key_env) {
            (Some(key), _) => key.clone(),
            (None, Some(env_name)) => std::env::var(env_name)
                .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()))?,
            (None, None) => return Err(ConfigError::MissingDeviceKey(self.name.clone())),
        };
        self.key_encoding
            .decode(&format!("key of device '{}'", self.name), raw)
    }

    /// Build the immutable device identity
    pub fn to_device(&self) -> Result<Device, ConfigError> {
        Ok(Device {
            name: self.name.clone(),
            id: self.id.clone(),
            key: self.resolve_key()?,
            address: self.address.clone(),
            version: self.version.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
broker_url = "mqtts://broker.local:8883"
client_id = "bridge-a"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30

[mqtt.tls]
ca_file = "ca.pem"
cert_file = "client.pem"
key_file = "client.key"

[bridge]
topic_root = "home/tuya/"
reconcile_interval_secs = 20

[[devices]]
name = "lamp1"
id = "abc"
key_env = "LAMP1_KEY"
address = "10.0.0.2"
"#;

        let config = BridgeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mqtt.client_id, "bridge-a");
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.bridge.topic_root, "home/tuya/");
        assert_eq!(config.reconcile_interval(), Duration::from_secs(20));
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].version, "3.3");
        let tls = config.mqtt.tls.unwrap();
        assert_eq!(tls.ca_file, PathBuf::from("ca.pem"));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.client_id, "tuya2mqtt");
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.bridge.topic_root, "tuya");
        assert_eq!(config.bridge.reconcile_interval_secs, 15);
        assert!(config.devices.is_empty());
        assert!(config.mqtt.tls.is_none());
    }

    #[test]
    fn test_duplicate_device_names_rejected() {
        let mut config = BridgeConfig::test_config();
        config.devices[1].name = "lamp1".to_string();

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::DuplicateDeviceName(ref n)) if n == "lamp1"));
    }

    #[test]
    fn test_invalid_device_name_rejected() {
        let mut config = BridgeConfig::test_config();
        config.devices[0].name = "lamp/1".to_string();

        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidDeviceName {
                source: ValidationError::InvalidDeviceNameChar('/'),
                ..
            })
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = BridgeConfig::test_config();
        config.bridge.reconcile_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_broker_scheme_rejected() {
        let mut config = BridgeConfig::test_config();
        config.mqtt.broker_url = "http://localhost:1883".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        config.mqtt.broker_url = "localhost:1883".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_tls_cert_without_key_rejected() {
        let mut config = BridgeConfig::test_config();
        config.mqtt.tls = Some(TlsSection {
            ca_file: PathBuf::from("ca.pem"),
            cert_file: Some(PathBuf::from("client.pem")),
            key_file: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_device_without_key_rejected() {
        let mut config = BridgeConfig::test_config();
        config.devices[0].key = None;
        config.devices[0].key_env = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDeviceKey(ref n)) if n == "lamp1"
        ));
    }

    #[test]
    fn test_device_identities_keep_order() {
        let config = BridgeConfig::test_config();
        let devices = config.device_identities().unwrap();

        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["lamp1", "lamp2"]);
        assert_eq!(devices[0].key, "0123456789abcdef");
        assert_eq!(devices[1].version, "3.4");
    }

    #[test]
    fn test_key_resolved_from_env() {
        let section = DeviceSection {
            name: "plug".to_string(),
            id: "p1".to_string(),
            key: None,
            key_env: Some("TUYA2MQTT_TEST_PLUG_KEY".to_string()),
            key_encoding: SecretEncoding::Plain,
            address: "10.0.0.9".to_string(),
            version: "3.3".to_string(),
        };

        std::env::set_var("TUYA2MQTT_TEST_PLUG_KEY", "secret-key");
        assert_eq!(section.resolve_key().unwrap(), "secret-key");
        std::env::remove_var("TUYA2MQTT_TEST_PLUG_KEY");

        assert!(matches!(
            section.resolve_key(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_redacted_masks_inline_keys() {
        let config = BridgeConfig::test_config();
        let redacted = config.redacted();
        assert!(redacted
            .devices
            .iter()
            .all(|d| d.key.as_deref() == Some("***")));
        // Original untouched
        assert_eq!(config.devices[0].key.as_deref(), Some("0123456789abcdef"));
    }

    #[test]
    fn test_relative_tls_paths_resolved() {
        let mut config = BridgeConfig::test_config();
        config.mqtt.tls = Some(TlsSection {
            ca_file: PathBuf::from("ca.pem"),
            cert_file: Some(PathBuf::from("/abs/client.pem")),
            key_file: Some(PathBuf::from("client.key")),
        });

        config.resolve_relative_paths(Path::new("/etc/tuya2mqtt"));
        let tls = config.mqtt.tls.unwrap();
        assert_eq!(tls.ca_file, PathBuf::from("/etc/tuya2mqtt/ca.pem"));
        assert_eq!(tls.cert_file, Some(PathBuf::from("/abs/client.pem")));
        assert_eq!(tls.key_file, Some(PathBuf::from("/etc/tuya2mqtt/client.key")));
    }

    #[test]
    fn test_base64_inline_key_decoded() {
        let config = BridgeConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost"

[[devices]]
name = "lamp1"
id = "a"
key = "MDEyMzQ1Njc4OWFiY2RlZg=="
key_encoding = "base64"
address = "10.0.0.1"
"#,
        )
        .unwrap();

        assert_eq!(config.devices[0].key_encoding, SecretEncoding::Base64);
        let devices = config.device_identities().unwrap();
        assert_eq!(devices[0].key, "0123456789abcdef");
    }

    #[test]
    fn test_invalid_base64_key_rejected() {
        let mut config = BridgeConfig::test_config();
        config.devices[0].key_encoding = SecretEncoding::Base64;
        config.devices[0].key = Some("not base64!".to_string());

        let error = config.device_identities().unwrap_err();
        assert!(matches!(error, ConfigError::InvalidSecret { .. }));
        assert!(error.to_string().contains("lamp1"));
    }

    #[test]
    fn test_mqtt_password_decoding() {
        let mut config = BridgeConfig::test_config();
        assert_eq!(config.get_mqtt_password().unwrap(), None);

        config.mqtt.password_env = Some("TUYA2MQTT_TEST_B64_PASSWORD".to_string());
        config.mqtt.password_encoding = SecretEncoding::Base64;
        std::env::set_var("TUYA2MQTT_TEST_B64_PASSWORD", "aHVudGVyMg==");
        assert_eq!(config.get_mqtt_password().unwrap().as_deref(), Some("hunter2"));

        config.mqtt.password_encoding = SecretEncoding::Plain;
        assert_eq!(
            config.get_mqtt_password().unwrap().as_deref(),
            Some("aHVudGVyMg==")
        );
        std::env::remove_var("TUYA2MQTT_TEST_B64_PASSWORD");
    }

    #[test]
    fn test_secret_encoding_defaults_to_plain() {
        let config = BridgeConfig::test_config();
        assert_eq!(config.mqtt.password_encoding, SecretEncoding::Plain);
        assert!(config
            .devices
            .iter()
            .all(|d| d.key_encoding == SecretEncoding::Plain));
    }
}
