//! Impure I/O operations for the MQTT link
//!
//! Owns the rumqttc event loop task. The task translates rumqttc events into
//! [`BrokerEvent`]s, re-issues subscriptions after every ConnAck and backs
//! off between failed connection attempts. rumqttc reconnects on the next
//! poll after an error, so the task only has to keep polling. Publishes are
//! refused while the link is down.

use super::connection::{configure_mqtt_options, MqttError, ReconnectConfig};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{BrokerClient, BrokerEvent, BrokerEventSender};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

/// MQTT broker client for the bridge
pub struct MqttClient {
    client: AsyncClient,
    /// Taken by the spawned task; the lock keeps the client `Sync`
    event_loop: StdMutex<Option<EventLoop>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    reconnect_config: ReconnectConfig,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Option<JoinHandle<()>>,
}

impl MqttClient {
    /// Create a client; nothing touches the network until [`BrokerClient::connect`]
    pub fn new(
        config: &MqttSection,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(config, username, password)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(MqttClient {
            client,
            event_loop: StdMutex::new(Some(event_loop)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(false)),
            reconnect_config: ReconnectConfig::default(),
            shutdown_tx,
            event_loop_handle: None,
        })
    }

    /// Override the backoff used between failed connection attempts
    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    /// Whether the last event seen on the link was a ConnAck
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Topic filters re-issued after every ConnAck
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    /// Spawn the event loop task
    fn start(&mut self, events: BrokerEventSender) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .ok()
            .and_then(Option::take)
            .ok_or(MqttError::AlreadyStarted)?;

        let task = EventLoopTask {
            client: self.client.clone(),
            subscriptions: self.subscriptions.clone(),
            connected: self.connected.clone(),
            reconnect_config: self.reconnect_config.clone(),
            events,
        };
        let shutdown_rx = self.shutdown_tx.subscribe();

        let span = crate::mqtt_span!(operation = "event_loop");
        self.event_loop_handle = Some(tokio::spawn(
            task.run(event_loop, shutdown_rx).instrument(span),
        ));
        Ok(())
    }
}

/// State moved into the spawned event loop task
struct EventLoopTask {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    reconnect_config: ReconnectConfig,
    events: BrokerEventSender,
}

impl EventLoopTask {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Starting MQTT event loop");
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.observe_route(&route, &mut failures).await;

                            if let Some(broker_event) = MessageHandler::to_broker_event(route) {
                                if self.events.send(broker_event).is_err() {
                                    debug!("Bridge stopped listening, stopping MQTT event loop");
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            self.connected.store(false, Ordering::SeqCst);
                            failures = failures.saturating_add(1);

                            let _ = self.events.send(BrokerEvent::Error(e.to_string()));
                            if self.events.send(BrokerEvent::Closed).is_err() {
                                break;
                            }

                            let delay_ms = self.reconnect_config.calculate_backoff_delay(failures);
                            debug!(attempt = failures, delay_ms, "Retrying MQTT connection");
                            if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("MQTT event loop stopped");
    }

    async fn observe_route(&self, route: &EventRoute, failures: &mut u32) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *failures = 0;
                self.connected.store(true, Ordering::SeqCst);
                self.resubscribe().await;
            }
            EventRoute::Disconnected => {
                self.connected.store(false, Ordering::SeqCst);
            }
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::MessageReceived { topic, .. } => {
                trace!(target: "mqtt_transport", topic = %topic, "Received MQTT message");
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    /// Re-issue every registered subscription.
    ///
    /// The requests are awaited on their own task: this task drains the
    /// request channel, so it can never wait for capacity itself, and a
    /// `try_subscribe` could be turned away by a full queue.
    async fn resubscribe(&self) {
        let topics = self.subscriptions.lock().await.clone();
        if topics.is_empty() {
            return;
        }

        let client = self.client.clone();
        tokio::spawn(
            async move {
                for topic in topics {
                    match client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
                        Ok(()) => debug!(target: "mqtt_transport", "Subscribed to: {}", topic),
                        Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
                    }
                }
            }
            .in_current_span(),
        );
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => {
            if *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
            true
        }
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self, events: BrokerEventSender) -> Result<(), Self::Error> {
        self.start(events)
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), Self::Error> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if subscriptions.iter().any(|existing| existing == filter) {
                return Ok(());
            }
            subscriptions.push(filter.to_string());
        }

        // Otherwise the next ConnAck issues it
        if self.is_connected() {
            self.client
                .try_subscribe(filter, QoS::AtMostOnce)
                .map_err(|e| MqttError::RequestRejected(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        // Queued requests would only replay stale state after the outage and
        // crowd out the resubscribe; the next full publish supersedes them.
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }

        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|e| MqttError::RequestRejected(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue MQTT disconnect: {}", e);
        }

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT event loop ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => warn!("MQTT event loop didn't shut down in time"),
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretEncoding;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    /// CONNACK, MQTT v5, success, no properties
    const CONNACK: [u8; 5] = [0x20, 0x03, 0x00, 0x00, 0x00];

    /// Read one control packet and return its packet type
    async fn read_packet_type(stream: &mut TcpStream) -> std::io::Result<u8> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await?;
        Ok(header >> 4)
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>, wanted: BrokerEvent) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("broker event expected")
                .expect("event channel open");
            if event == wanted {
                return;
            }
        }
    }

    fn test_config(broker_url: &str) -> MqttSection {
        MqttSection {
            broker_url: broker_url.to_string(),
            client_id: "tuya2mqtt-test".to_string(),
            username_env: None,
            password_env: None,
            password_encoding: SecretEncoding::Plain,
            keep_alive_secs: 60,
            tls: None,
        }
    }

    #[tokio::test]
    async fn test_client_creation_does_not_connect() {
        let client = MqttClient::new(&test_config("mqtt://localhost:1883"), None, None).unwrap();
        assert!(!client.is_connected());
        assert!(client.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let result = MqttClient::new(&test_config("not a url"), None, None);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[tokio::test]
    async fn test_subscribe_registers_filter_once() {
        let mut client =
            MqttClient::new(&test_config("mqtt://localhost:1883"), None, None).unwrap();

        client.subscribe("tuya/#").await.unwrap();
        client.subscribe("tuya/#").await.unwrap();

        assert_eq!(client.subscriptions().await, vec!["tuya/#".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_rejected_without_connection() {
        let client = MqttClient::new(&test_config("mqtt://localhost:1883"), None, None).unwrap();
        let result = client
            .publish("tuya/lamp1/state", b"{}".to_vec(), true)
            .await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let mut client =
            MqttClient::new(&test_config("mqtt://127.0.0.1:1"), None, None).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        client.connect(tx.clone()).await.unwrap();
        let second = client.connect(tx).await;
        assert!(matches!(second, Err(MqttError::AlreadyStarted)));

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_error_then_close() {
        let mut client = MqttClient::new(&test_config("mqtt://127.0.0.1:1"), None, None)
            .unwrap()
            .with_reconnect_config(ReconnectConfig {
                backoff_pattern: vec![],
                sustained_delay: 10_000,
            });
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.connect(tx).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event expected")
            .unwrap();
        assert!(matches!(first, BrokerEvent::Error(_)));

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event expected")
            .unwrap();
        assert_eq!(second, BrokerEvent::Closed);
        assert!(!client.is_connected());

        // Shutdown interrupts the long backoff sleep
        let started = std::time::Instant::now();
        client.disconnect().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_outage_backlog_does_not_starve_resubscribe() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let broker_url = format!("mqtt://127.0.0.1:{port}");
        let mut client = MqttClient::new(&test_config(&broker_url), None, None)
            .unwrap()
            .with_reconnect_config(ReconnectConfig {
                backoff_pattern: vec![],
                sustained_delay: 100,
            });
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe("tuya/#").await.unwrap();
        client.connect(tx).await.unwrap();
        wait_for(&mut rx, BrokerEvent::Closed).await;

        // More state publishes than the request channel holds
        for _ in 0..REQUEST_CAPACITY + 16 {
            let result = client
                .publish("tuya/lamp1/state", b"{}".to_vec(), true)
                .await;
            assert!(matches!(result, Err(MqttError::NotConnected)));
        }

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client should reconnect")
            .unwrap();
        assert_eq!(read_packet_type(&mut stream).await.unwrap(), 1, "CONNECT");
        stream.write_all(&CONNACK).await.unwrap();
        wait_for(&mut rx, BrokerEvent::Connected).await;
        assert!(client.is_connected());

        let next = tokio::time::timeout(Duration::from_secs(5), read_packet_type(&mut stream))
            .await
            .expect("subscription should be re-issued")
            .unwrap();
        assert_eq!(next, 8, "SUBSCRIBE");

        client
            .publish("tuya/lamp1/state", b"{}".to_vec(), true)
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), read_packet_type(&mut stream))
            .await
            .expect("publish should follow")
            .unwrap();
        assert_eq!(next, 3, "PUBLISH");

        client.disconnect().await.unwrap();
    }
}
