//! Mock implementations for testing
//!
//! Recording stand-ins for the broker and device collaborators. Clones share
//! their recorders, so a test can keep a handle after moving a mock into a
//! bridge.

use crate::protocol::DataPoints;
use crate::transport::{
    BrokerClient, BrokerEvent, BrokerEventSender, DeviceClient, DeviceEvent, DeviceEventSink,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure injected by a mock
#[derive(Debug, Error)]
#[error("Mock failure: {0}")]
pub struct MockError(pub String);

/// Publish recorded by [`MockBroker`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Mock broker recording subscriptions and publishes
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    events: Arc<StdMutex<Option<BrokerEventSender>>>,
    should_fail: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Publishes to `topic`, oldest first
    pub async fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
    }

    /// Whether `connect` handed us an event channel
    pub fn is_started(&self) -> bool {
        self.events
            .lock()
            .map(|events| events.is_some())
            .unwrap_or(false)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Inject a broker event; false if not connected or the bridge is gone
    pub fn emit(&self, event: BrokerEvent) -> bool {
        match self.events.lock() {
            Ok(events) => events
                .as_ref()
                .map(|sender| sender.send(event).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn check(&self, operation: &str) -> Result<(), MockError> {
        if self.should_fail.load(Ordering::SeqCst) {
            Err(MockError(format!("{operation} failed")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    type Error = MockError;

    async fn connect(&mut self, events: BrokerEventSender) -> Result<(), Self::Error> {
        self.check("connect")?;
        if let Ok(mut slot) = self.events.lock() {
            *slot = Some(events);
        }
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), Self::Error> {
        self.check("subscribe")?;
        self.subscriptions.lock().await.push(filter.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        self.check("publish")?;
        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock device recording connect attempts and commands
#[derive(Debug, Clone)]
pub struct MockDevice {
    sink: DeviceEventSink,
    connected: Arc<AtomicBool>,
    auto_connect: bool,
    connect_calls: Arc<AtomicUsize>,
    sent: Arc<StdMutex<Vec<DataPoints>>>,
    should_fail: Arc<AtomicBool>,
}

impl MockDevice {
    pub fn new(sink: DeviceEventSink) -> Self {
        Self {
            sink,
            connected: Arc::new(AtomicBool::new(false)),
            auto_connect: false,
            connect_calls: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(StdMutex::new(Vec::new())),
            should_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Report `Connected` through the sink on every successful connect
    pub fn with_auto_connect(mut self) -> Self {
        self.auto_connect = true;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make connect and send fail
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Commands received, oldest first
    pub fn sent(&self) -> Vec<DataPoints> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Report an event as this device
    pub fn emit(&self, event: DeviceEvent) -> bool {
        match event {
            DeviceEvent::Connected => self.set_connected(true),
            DeviceEvent::Disconnected => self.set_connected(false),
            _ => {}
        }
        self.sink.emit(event)
    }
}

#[async_trait]
impl DeviceClient for MockDevice {
    type Error = MockError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(MockError("connect failed".to_string()));
        }
        if self.auto_connect {
            self.emit(DeviceEvent::Connected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, command: &DataPoints) -> Result<(), Self::Error> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(MockError("send failed".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.clone());
        }
        Ok(())
    }
}
