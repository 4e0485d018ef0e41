//! Pure connection configuration for the MQTT link
//!
//! Builds rumqttc options from configuration and computes the delay between
//! failed connection attempts.

use crate::config::{MqttSection, TlsSection};
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Custom backoff pattern in milliseconds (if empty, uses sustained delay)
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![25, 50, 100, 250, 1000, 2500],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based); attempts retry forever
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        if self.backoff_pattern.is_empty() {
            self.sustained_delay
        } else {
            let index = (attempt.saturating_sub(1)) as usize;
            if index < self.backoff_pattern.len() {
                self.backoff_pattern[index]
            } else {
                self.sustained_delay
            }
        }
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Failed to read TLS material {path}")]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Request rejected by MQTT client: {0}")]
    RequestRejected(String),
    #[error("Event loop already started")]
    AlreadyStarted,
    #[error("Not connected to the broker")]
    NotConnected,
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let secure = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        secure,
    })
}

/// Build MQTT options from configuration and resolved credentials
pub fn configure_mqtt_options(
    config: &MqttSection,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<MqttOptions, MqttError> {
    let endpoint = parse_broker_url(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(&config.client_id, endpoint.host, endpoint.port);

    if endpoint.secure {
        let transport = match &config.tls {
            Some(tls) => RumqttcTransport::tls_with_config(load_tls_configuration(tls)?),
            None => RumqttcTransport::tls_with_default_config(),
        };
        mqtt_options.set_transport(transport);
    }

    if let Some(username) = username {
        mqtt_options.set_credentials(username, password.unwrap_or_default());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    Ok(mqtt_options)
}

fn read_material(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })
}

/// Load CA and optional client certificate/key from disk
fn load_tls_configuration(tls: &TlsSection) -> Result<TlsConfiguration, MqttError> {
    let ca = read_material(&tls.ca_file)?;
    let client_auth = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => Some((read_material(cert)?, read_material(key)?)),
        _ => None,
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretEncoding;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "tuya2mqtt-test".to_string(),
            username_env: None,
            password_env: None,
            password_encoding: SecretEncoding::Plain,
            keep_alive_secs: 60,
            tls: None,
        }
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(6), 2500);

        // Sustained delay after pattern exhausted
        assert_eq!(config.calculate_backoff_delay(7), 5000);
        assert_eq!(config.calculate_backoff_delay(1000), 5000);
    }

    #[test]
    fn test_empty_backoff_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            backoff_pattern: vec![],
            sustained_delay: 300,
        };
        assert_eq!(config.calculate_backoff_delay(1), 300);
        assert_eq!(config.calculate_backoff_delay(0), 300);
    }

    #[test]
    fn test_parse_broker_url() {
        let endpoint = parse_broker_url("mqtt://broker.local").unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.secure);

        let endpoint = parse_broker_url("mqtts://broker.local").unwrap();
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.secure);

        let endpoint = parse_broker_url("mqtt://10.0.0.1:2883").unwrap();
        assert_eq!(endpoint.port, 2883);
    }

    #[test]
    fn test_invalid_broker_url() {
        assert!(matches!(
            parse_broker_url("invalid-url"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            parse_broker_url("http://localhost:1883"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_mqtt_config();
        let options = configure_mqtt_options(&config, Some("user"), Some("pass")).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
        assert_eq!(options.client_id(), "tuya2mqtt-test");
    }

    #[test]
    fn test_missing_tls_material() {
        let mut config = test_mqtt_config();
        config.broker_url = "mqtts://localhost".to_string();
        config.tls = Some(TlsSection {
            ca_file: PathBuf::from("/nonexistent/ca.pem"),
            cert_file: None,
            key_file: None,
        });

        let result = configure_mqtt_options(&config, None, None);
        assert!(matches!(result, Err(MqttError::TlsMaterial { .. })));
    }

    #[test]
    fn test_tls_material_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, b"-----BEGIN CERTIFICATE-----\n").unwrap();

        let tls = TlsSection {
            ca_file: ca,
            cert_file: None,
            key_file: None,
        };
        let loaded = load_tls_configuration(&tls).unwrap();
        assert!(matches!(
            loaded,
            TlsConfiguration::Simple {
                client_auth: None,
                ..
            }
        ));
    }
}
