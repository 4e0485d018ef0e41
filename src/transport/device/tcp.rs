//! TCP link to a device gateway
//!
//! `connect` spawns a connection task and returns at once. The task performs
//! the handshake, requests a refresh, then multiplexes inbound frames and
//! queued commands until the socket closes. Every outcome is reported
//! through the device's [`DeviceEventSink`].

use super::{frame, socket_address, DeviceError};
use crate::bridge::Device;
use crate::protocol::DataPoints;
use crate::transport::{DeviceClient, DeviceEvent, DeviceEventSink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type FrameSender = mpsc::UnboundedSender<String>;

/// Device client speaking newline-delimited JSON over TCP
pub struct TcpDeviceClient {
    device: Device,
    sink: DeviceEventSink,
    connect_timeout: Duration,
    connected: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    writer: Arc<Mutex<Option<FrameSender>>>,
    handle: Option<JoinHandle<()>>,
}

impl TcpDeviceClient {
    pub fn new(device: &Device, sink: DeviceEventSink) -> Self {
        Self {
            device: device.clone(),
            sink,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connected: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicBool::new(false)),
            writer: Arc::new(Mutex::new(None)),
            handle: None,
        }
    }
}

/// State moved into the spawned connection task
struct Connection {
    device: Device,
    sink: DeviceEventSink,
    connect_timeout: Duration,
    connected: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    writer: Arc<Mutex<Option<FrameSender>>>,
}

impl Connection {
    async fn run(self) {
        let address = socket_address(&self.device.address);

        match self.open(&address).await {
            Ok(stream) => self.serve(stream).await,
            Err(e) => {
                warn!(device = %self.device.name, address = %address, "Device connection failed: {}", e);
                self.sink.emit(DeviceEvent::Error(e.to_string()));
            }
        }

        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
        self.sink.emit(DeviceEvent::Disconnected);
    }

    async fn open(&self, address: &str) -> Result<TcpStream, DeviceError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(DeviceError::ConnectTimeout {
                address: address.to_string(),
            }),
        }
    }

    async fn serve(&self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();

        let handshake = frame::hello(&self.device)
            .and_then(|hello| Ok((hello, frame::refresh()?)));
        let (hello, refresh) = match handshake {
            Ok(frames) => frames,
            Err(e) => {
                self.sink.emit(DeviceEvent::Error(e.to_string()));
                return;
            }
        };
        let _ = frames_tx.send(hello);
        let _ = frames_tx.send(refresh);

        if let Ok(mut writer) = self.writer.lock() {
            *writer = Some(frames_tx);
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(device = %self.device.name, "Device connected");
        self.sink.emit(DeviceEvent::Connected);

        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match frame::parse(&line) {
                        Ok(Some(event)) => {
                            if !self.sink.emit(event) {
                                break;
                            }
                        }
                        Ok(None) => debug!(device = %self.device.name, "Ignoring device frame"),
                        Err(e) => warn!(device = %self.device.name, "Dropping device frame: {}", e),
                    },
                    Ok(None) => {
                        info!(device = %self.device.name, "Device closed the connection");
                        break;
                    }
                    Err(e) => {
                        self.sink.emit(DeviceEvent::Error(e.to_string()));
                        break;
                    }
                },

                outbound = frames_rx.recv() => {
                    let Some(outbound) = outbound else { break };
                    if let Err(e) = write_half.write_all(outbound.as_bytes()).await {
                        self.sink.emit(DeviceEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DeviceClient for TcpDeviceClient {
    type Error = DeviceError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        // One attempt at a time; the running task reports its own outcome
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(device = %self.device.name, "Connection attempt already in flight");
            return Ok(());
        }

        let connection = Connection {
            device: self.device.clone(),
            sink: self.sink.clone(),
            connect_timeout: self.connect_timeout,
            connected: self.connected.clone(),
            in_flight: self.in_flight.clone(),
            writer: self.writer.clone(),
        };
        self.handle = Some(tokio::spawn(connection.run()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, command: &DataPoints) -> Result<(), Self::Error> {
        let line = frame::set(command)?;
        let writer = self.writer.lock().map_err(|_| DeviceError::NotConnected)?;
        match writer.as_ref() {
            Some(frames) => frames.send(line).map_err(|_| DeviceError::NotConnected),
            None => Err(DeviceError::NotConnected),
        }
    }
}

impl Drop for TcpDeviceClient {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
