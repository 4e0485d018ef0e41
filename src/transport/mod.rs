//! Transport layer for the broker and device links
//!
//! Both collaborators are abstracted behind traits so the bridge core can be
//! driven by mocks in tests. Each link reports what happens to it as tagged
//! events over a channel owned by the bridge; the bridge task is the single
//! consumer of all of them.

use crate::protocol::DataPoints;
use tokio::sync::mpsc;

pub mod device;
pub mod mqtt;

/// Event emitted by the broker link
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Connection acknowledged by the broker
    Connected,
    /// Connection closed or failed
    Closed,
    /// Transport error; state is only affected by a following `Closed`
    Error(String),
    /// Message received on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
}

/// Event emitted by a device link
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    /// Spontaneous state report
    Data(DataPoints),
    /// Answer to a refresh request
    DataRefresh(DataPoints),
    Disconnected,
    Error(String),
}

/// Device event tagged with the index of the device that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEnvelope {
    pub device: usize,
    pub event: DeviceEvent,
}

/// Sender half handed to the broker link
pub type BrokerEventSender = mpsc::UnboundedSender<BrokerEvent>;

/// Per-device handle used by a device client to report events.
///
/// Every sink of a bridge feeds the same channel; events of one device keep
/// the order they were emitted in.
#[derive(Debug, Clone)]
pub struct DeviceEventSink {
    device: usize,
    sender: mpsc::UnboundedSender<DeviceEnvelope>,
}

impl DeviceEventSink {
    pub fn new(device: usize, sender: mpsc::UnboundedSender<DeviceEnvelope>) -> Self {
        Self { device, sender }
    }

    /// Index of the device this sink reports for
    pub fn device(&self) -> usize {
        self.device
    }

    /// Report an event; returns false once the bridge has stopped listening
    pub fn emit(&self, event: DeviceEvent) -> bool {
        self.sender
            .send(DeviceEnvelope {
                device: self.device,
                event,
            })
            .is_ok()
    }
}

/// Broker-side collaborator
///
/// Publishing is fire-and-forget: implementations must not wait for the
/// broker, only hand the request to their I/O task.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the connection; lifecycle and messages arrive on `events`
    async fn connect(&mut self, events: BrokerEventSender) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter, kept across reconnects
    async fn subscribe(&mut self, filter: &str) -> Result<(), Self::Error>;

    /// Queue a QoS 0 publish
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), Self::Error>;

    /// Disconnect from the broker and stop the I/O task
    async fn disconnect(&mut self) -> Result<(), Self::Error>;
}

/// Device-side collaborator
#[async_trait::async_trait]
pub trait DeviceClient: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Issue a connection attempt. Returns once the attempt is started;
    /// the outcome is reported through the device's event sink.
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Whether the link is currently up
    fn is_connected(&self) -> bool;

    /// Send a data-point command to the device
    async fn send(&self, command: &DataPoints) -> Result<(), Self::Error>;
}
