//! Bridge core
//!
//! One [`Bridge`] owns the broker link tracker and, per device, a link
//! tracker, a state store and the device client. It is the single consumer
//! of every broker event, device event and reconcile tick, so no state is
//! ever written from two places.
//!
//! - [`link_state`] - five-state link lifecycle
//! - [`device_state`] - device identity and merged data points
//! - [`router`] - inbound topic routing and state publish building
//! - [`reconciler`] - periodic republish and reconnect plan

pub mod device_state;
pub mod link_state;
pub mod reconciler;
pub mod router;

pub use device_state::{Device, DeviceSnapshot, DeviceStateStore};
pub use link_state::{LinkSignal, LinkState, LinkTracker};
pub use reconciler::{ReconcilePlan, Reconciler, DEFAULT_RECONCILE_INTERVAL};
pub use router::{IgnoreReason, InboundDecision, Router, StatePublish};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::TopicScheme;
use crate::transport::{
    BrokerClient, BrokerEvent, BrokerEventSender, DeviceClient, DeviceEnvelope, DeviceEvent,
    DeviceEventSink,
};
use crate::{bridge_span, device_span};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

/// Label of the broker link in logs
pub const BROKER_LINK: &str = "mqtt";

/// Everything the bridge keeps for one device
struct DeviceSlot<D> {
    device: Device,
    link: LinkTracker,
    store: DeviceStateStore,
    client: D,
}

/// State bridge between a broker client and a set of device clients
pub struct Bridge<B, D> {
    broker: B,
    broker_link: LinkTracker,
    router: Router,
    reconciler: Reconciler,
    devices: Vec<DeviceSlot<D>>,
    broker_events_tx: BrokerEventSender,
    broker_events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    device_events_rx: mpsc::UnboundedReceiver<DeviceEnvelope>,
}

impl<B, D> Bridge<B, D>
where
    B: BrokerClient,
    D: DeviceClient,
{
    /// Build a bridge; `make_client` is called once per device, in order,
    /// with the sink that device must report through.
    pub fn new<F>(
        scheme: TopicScheme,
        reconciler: Reconciler,
        broker: B,
        devices: Vec<Device>,
        mut make_client: F,
    ) -> BridgeResult<Self>
    where
        F: FnMut(&Device, DeviceEventSink) -> D,
    {
        let router = Router::new(scheme, &devices)?;
        let (broker_events_tx, broker_events_rx) = mpsc::unbounded_channel();
        let (device_events_tx, device_events_rx) = mpsc::unbounded_channel();

        let devices = devices
            .into_iter()
            .enumerate()
            .map(|(index, device)| {
                let sink = DeviceEventSink::new(index, device_events_tx.clone());
                let client = make_client(&device, sink);
                DeviceSlot {
                    link: LinkTracker::new(format!("device={}", device.name)),
                    store: DeviceStateStore::new(),
                    device,
                    client,
                }
            })
            .collect();

        Ok(Self {
            broker,
            broker_link: LinkTracker::new(BROKER_LINK),
            router,
            reconciler,
            devices,
            broker_events_tx,
            broker_events_rx,
            device_events_rx,
        })
    }

    /// Build a bridge from validated configuration
    pub fn from_config<F>(config: &BridgeConfig, broker: B, make_client: F) -> BridgeResult<Self>
    where
        F: FnMut(&Device, DeviceEventSink) -> D,
    {
        Self::new(
            TopicScheme::new(&config.bridge.topic_root),
            Reconciler::new(config.reconcile_interval()),
            broker,
            config.device_identities()?,
            make_client,
        )
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn broker_state(&self) -> LinkState {
        self.broker_link.state()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_state(&self, name: &str) -> Option<LinkState> {
        self.slot(name).map(|slot| slot.link.state())
    }

    pub fn snapshot(&self, name: &str) -> Option<DeviceSnapshot> {
        self.slot(name).map(|slot| slot.store.snapshot())
    }

    pub fn device_client(&self, name: &str) -> Option<&D> {
        self.slot(name).map(|slot| &slot.client)
    }

    fn slot(&self, name: &str) -> Option<&DeviceSlot<D>> {
        self.router
            .device_index(name)
            .and_then(|index| self.devices.get(index))
    }

    /// Subscribe to the command topics, connect the broker and start every
    /// device connection attempt.
    ///
    /// Broker failures here are bootstrap errors. Device connect failures are
    /// logged; the reconciler retries them.
    pub async fn start(&mut self) -> BridgeResult<()> {
        let filter = self.router.subscription_filter();
        self.broker
            .subscribe(&filter)
            .await
            .map_err(BridgeError::broker)?;
        info!(filter = %filter, "Subscribed to command topics");

        self.broker
            .connect(self.broker_events_tx.clone())
            .await
            .map_err(BridgeError::broker)?;

        for slot in &mut self.devices {
            if let Err(e) = slot.client.connect().await {
                warn!(device = %slot.device.name, "Device connect failed: {}", e);
            }
        }

        info!(devices = self.devices.len(), "Bridge started");
        Ok(())
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> BridgeResult<()> {
        self.start().await?;

        let mut ticker = self.reconciler.ticker();
        info!(
            interval_secs = self.reconciler.period().as_secs(),
            "Reconciler scheduled"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(event) = self.broker_events_rx.recv() => {
                    self.handle_broker_event(event).await;
                }
                Some(envelope) = self.device_events_rx.recv() => {
                    self.handle_device_event(envelope).await;
                }
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Handle every event already queued, without waiting for new ones
    pub async fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.broker_events_rx.try_recv() {
                self.handle_broker_event(event).await;
            } else if let Ok(envelope) = self.device_events_rx.try_recv() {
                self.handle_device_event(envelope).await;
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    /// Apply one broker link event
    pub async fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                let transition = self.broker_link.apply(LinkSignal::Connect);
                if transition.is_some_and(|state| state.is_up()) {
                    self.publish_all().await;
                }
            }
            BrokerEvent::Closed => {
                self.broker_link.apply(LinkSignal::Close);
            }
            BrokerEvent::Error(message) => {
                error!(link = BROKER_LINK, "Broker link error: {}", message);
            }
            BrokerEvent::Message { topic, payload } => {
                self.handle_inbound(&topic, &payload)
                    .instrument(bridge_span!(topic = %topic))
                    .await;
            }
        }
    }

    async fn handle_inbound(&mut self, topic: &str, payload: &[u8]) {
        match self.router.route_inbound(topic, payload) {
            InboundDecision::Forward { device, command } => {
                let Some(slot) = self.devices.get(device) else {
                    return;
                };
                debug!(device = %slot.device.name, "Forwarding set-state command");
                if let Err(e) = slot.client.send(&command).await {
                    error!(device = %slot.device.name, "Failed to send command: {}", e);
                }
            }
            InboundDecision::Malformed { device, error } => {
                let name = self
                    .devices
                    .get(device)
                    .map(|slot| slot.device.name.as_str())
                    .unwrap_or_default();
                warn!(device = %name, "Dropping malformed set-state payload: {}", error);
            }
            InboundDecision::Ignored(reason) => {
                debug!(reason = ?reason, "Ignoring inbound message");
            }
        }
    }

    /// Apply one device event and publish the device's state
    pub async fn handle_device_event(&mut self, envelope: DeviceEnvelope) {
        let DeviceEnvelope { device, event } = envelope;
        let Some(slot) = self.devices.get_mut(device) else {
            warn!(device, "Event for unknown device index");
            return;
        };
        let span = device_span!(device = %slot.device.name);
        let changed = {
            let _entered = span.enter();
            match event {
                DeviceEvent::Connected => {
                    slot.link.apply(LinkSignal::Connect);
                    slot.store.apply_connected();
                    true
                }
                DeviceEvent::Data(partial) => {
                    debug!(points = partial.len(), "Device data");
                    slot.store.apply_data(&partial);
                    true
                }
                DeviceEvent::DataRefresh(partial) => {
                    debug!(points = partial.len(), "Device data refresh");
                    slot.store.apply_data(&partial);
                    true
                }
                DeviceEvent::Disconnected => {
                    slot.link.apply(LinkSignal::Close);
                    slot.store.apply_disconnected();
                    true
                }
                DeviceEvent::Error(message) => {
                    error!("Device link error: {}", message);
                    false
                }
            }
        };

        if changed {
            self.publish_device(device).await;
        }
    }

    /// One reconciliation tick: republish everything, reconnect down devices
    pub async fn reconcile(&mut self) {
        let plan = self
            .reconciler
            .plan(self.devices.iter().map(|slot| slot.client.is_connected()));
        debug!(
            republish = plan.republish.len(),
            reconnect = plan.reconnect.len(),
            "Reconciling"
        );

        for index in plan.republish {
            self.publish_device(index).await;
        }

        for index in plan.reconnect {
            if let Some(slot) = self.devices.get_mut(index) {
                info!(device = %slot.device.name, "Device link down, reconnecting");
                if let Err(e) = slot.client.connect().await {
                    warn!(device = %slot.device.name, "Reconnect attempt failed: {}", e);
                }
            }
        }
    }

    async fn publish_all(&self) {
        info!(devices = self.devices.len(), "Publishing state of every device");
        for index in 0..self.devices.len() {
            self.publish_device(index).await;
        }
    }

    /// Fire-and-forget retained publish of a device's current snapshot
    async fn publish_device(&self, index: usize) {
        let Some(slot) = self.devices.get(index) else {
            return;
        };
        let timestamp = chrono::Utc::now().timestamp_millis();

        let publish = match self.router.state_publish(index, &slot.store.snapshot(), timestamp) {
            Some(Ok(publish)) => publish,
            Some(Err(e)) => {
                error!(device = %slot.device.name, "Failed to encode state: {}", e);
                return;
            }
            None => return,
        };

        debug!(topic = %publish.topic, "Publishing device state");
        if let Err(e) = self
            .broker
            .publish(&publish.topic, publish.payload, true)
            .await
        {
            error!(topic = %publish.topic, "Failed to publish state: {}", e);
        }
    }

    /// Disconnect from the broker
    pub async fn stop(&mut self) {
        info!("Stopping bridge");
        if let Err(e) = self.broker.disconnect().await {
            warn!("Broker disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatePayload;
    use crate::testing::mocks::{MockBroker, MockDevice};
    use serde_json::json;

    fn device(name: &str) -> Device {
        Device {
            name: name.to_string(),
            id: format!("{name}-id"),
            key: "key".to_string(),
            address: "127.0.0.1".to_string(),
            version: "3.3".to_string(),
        }
    }

    fn bridge(names: &[&str]) -> Bridge<MockBroker, MockDevice> {
        Bridge::new(
            TopicScheme::new("tuya"),
            Reconciler::default(),
            MockBroker::new(),
            names.iter().map(|name| device(name)).collect(),
            |_, sink| MockDevice::new(sink),
        )
        .unwrap()
    }

    fn envelope(device: usize, event: DeviceEvent) -> DeviceEnvelope {
        DeviceEnvelope { device, event }
    }

    #[tokio::test]
    async fn test_duplicate_devices_rejected() {
        let result = Bridge::new(
            TopicScheme::new("tuya"),
            Reconciler::default(),
            MockBroker::new(),
            vec![device("lamp1"), device("lamp1")],
            |_, sink| MockDevice::new(sink),
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_subscribes_and_connects_everything() {
        let mut bridge = bridge(&["lamp1", "lamp2"]);
        bridge.start().await.unwrap();

        assert_eq!(bridge.broker().subscriptions().await, vec!["tuya/#"]);
        assert!(bridge.broker().is_started());
        assert_eq!(bridge.device_client("lamp1").unwrap().connect_calls(), 1);
        assert_eq!(bridge.device_client("lamp2").unwrap().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_fails() {
        let mut bridge = bridge(&["lamp1"]);
        bridge.broker().set_should_fail(true);
        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::Broker(_))
        ));
    }

    #[tokio::test]
    async fn test_device_data_publishes_merged_state() {
        let mut bridge = bridge(&["lamp1"]);
        let partial = serde_json::from_value(json!({"1": true})).unwrap();
        bridge
            .handle_device_event(envelope(0, DeviceEvent::Data(partial)))
            .await;

        let published = bridge.broker().published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "tuya/lamp1/state");
        assert!(published[0].retain);

        let payload = StatePayload::from_slice(&published[0].payload).unwrap();
        assert!(payload.connected);
        assert_eq!(payload.data_points["1"], json!(true));
    }

    #[tokio::test]
    async fn test_device_error_changes_nothing() {
        let mut bridge = bridge(&["lamp1"]);
        bridge
            .handle_device_event(envelope(0, DeviceEvent::Error("boom".to_string())))
            .await;

        assert!(bridge.broker().published().await.is_empty());
        assert_eq!(bridge.device_state("lamp1"), Some(LinkState::Unknown));
    }

    #[tokio::test]
    async fn test_device_lifecycle_is_tracked() {
        let mut bridge = bridge(&["lamp1"]);
        bridge
            .handle_device_event(envelope(0, DeviceEvent::Disconnected))
            .await;
        assert_eq!(bridge.device_state("lamp1"), Some(LinkState::Unconnected));

        bridge
            .handle_device_event(envelope(0, DeviceEvent::Connected))
            .await;
        assert_eq!(bridge.device_state("lamp1"), Some(LinkState::Connected));

        bridge
            .handle_device_event(envelope(0, DeviceEvent::Disconnected))
            .await;
        bridge
            .handle_device_event(envelope(0, DeviceEvent::Connected))
            .await;
        assert_eq!(bridge.device_state("lamp1"), Some(LinkState::Reconnected));
        assert_eq!(bridge.broker().published().await.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_device_index_ignored() {
        let mut bridge = bridge(&["lamp1"]);
        bridge
            .handle_device_event(envelope(9, DeviceEvent::Connected))
            .await;
        assert!(bridge.broker().published().await.is_empty());
    }

    #[tokio::test]
    async fn test_redundant_broker_connect_does_not_republish() {
        let mut bridge = bridge(&["lamp1", "lamp2"]);
        bridge.handle_broker_event(BrokerEvent::Connected).await;
        bridge.handle_broker_event(BrokerEvent::Connected).await;

        assert_eq!(bridge.broker().published().await.len(), 2);
        assert_eq!(bridge.broker_state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_broker_reconnect_republishes() {
        let mut bridge = bridge(&["lamp1"]);
        bridge.handle_broker_event(BrokerEvent::Connected).await;
        bridge.handle_broker_event(BrokerEvent::Error("reset".into())).await;
        bridge.handle_broker_event(BrokerEvent::Closed).await;
        bridge.handle_broker_event(BrokerEvent::Closed).await;
        assert_eq!(bridge.broker_state(), LinkState::Disconnected);

        bridge.handle_broker_event(BrokerEvent::Connected).await;
        assert_eq!(bridge.broker_state(), LinkState::Reconnected);
        assert_eq!(bridge.broker().published().await.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_command_dropped() {
        let mut bridge = bridge(&["lamp1"]);
        bridge
            .handle_broker_event(BrokerEvent::Message {
                topic: "tuya/lamp1/set-state".to_string(),
                payload: b"{broken".to_vec(),
            })
            .await;

        assert!(bridge.device_client("lamp1").unwrap().sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_contained() {
        let mut bridge = bridge(&["lamp1"]);
        bridge.device_client("lamp1").unwrap().set_should_fail(true);
        bridge
            .handle_broker_event(BrokerEvent::Message {
                topic: "tuya/lamp1/set-state".to_string(),
                payload: br#"{"1":true}"#.to_vec(),
            })
            .await;

        assert!(bridge.device_client("lamp1").unwrap().sent().is_empty());
        assert!(bridge.broker().published().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_republishes_and_reconnects() {
        let mut bridge = bridge(&["lamp1", "lamp2"]);
        bridge.device_client("lamp1").unwrap().set_connected(true);

        bridge.reconcile().await;

        assert_eq!(bridge.broker().published().await.len(), 2);
        assert_eq!(bridge.device_client("lamp1").unwrap().connect_calls(), 0);
        assert_eq!(bridge.device_client("lamp2").unwrap().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_drain_pending_handles_queued_events() {
        let mut bridge = bridge(&["lamp1"]);
        bridge.start().await.unwrap();

        bridge.broker().emit(BrokerEvent::Connected);
        bridge.device_client("lamp1").unwrap().emit(DeviceEvent::Connected);

        assert_eq!(bridge.drain_pending().await, 2);
        assert_eq!(bridge.broker_state(), LinkState::Connected);
        assert_eq!(bridge.device_state("lamp1"), Some(LinkState::Connected));
        assert_eq!(bridge.drain_pending().await, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bridge = bridge(&["lamp1"]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(bridge.run(shutdown_rx));
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("bridge should stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
