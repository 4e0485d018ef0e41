//! MQTT broker link built on rumqttc (MQTT v5)
//!
//! Split the same way as the rest of the transport code:
//!
//! - [`connection`] - pure option building and reconnect backoff
//! - [`message_handler`] - pure translation of rumqttc events
//! - [`client`] - the I/O task and [`BrokerClient`](crate::transport::BrokerClient) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use tuya2mqtt::transport::mqtt::MqttClient;
//! use tuya2mqtt::transport::BrokerClient;
//! use tuya2mqtt::config::{MqttSection, SecretEncoding};
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     client_id: "tuya2mqtt".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     password_encoding: SecretEncoding::Plain,
//!     keep_alive_secs: 60,
//!     tls: None,
//! };
//!
//! let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut client = MqttClient::new(&config, None, None)?;
//! client.subscribe("tuya/#").await?;
//! client.connect(events_tx).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, MqttError, ReconnectConfig};
pub use message_handler::{EventRoute, MessageHandler};
