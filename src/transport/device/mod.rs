//! Device link implementations
//!
//! The encrypted vendor protocol is handled by a local gateway; the bridge
//! talks to it with newline-delimited JSON frames over TCP (see [`frame`]).

pub mod frame;
pub mod tcp;

pub use tcp::TcpDeviceClient;

use thiserror::Error;

/// Default TCP port of a device endpoint
pub const DEFAULT_DEVICE_PORT: u16 = 6668;

/// Device transport errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device is not connected")]
    NotConnected,
    #[error("Connection to {address} timed out")]
    ConnectTimeout { address: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid device frame: {0}")]
    InvalidFrame(#[source] serde_json::Error),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

/// Resolve `host` or `host:port` into a connectable address
pub fn socket_address(address: &str) -> String {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ => format!("{address}:{DEFAULT_DEVICE_PORT}"),
    }
}
