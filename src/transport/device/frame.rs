//! Newline-delimited JSON frames spoken with the device gateway
//!
//! Outbound:
//! - `{"hello":{"id":..,"key":..,"version":..}}` once per connection
//! - `{"refresh":true}` to request a full data-point report
//! - `{"set":{<dp>:<value>,..}}` to change data points
//!
//! Inbound:
//! - `{"dps":{..}}` spontaneous report
//! - `{"dps":{..},"refresh":true}` answer to a refresh request
//!
//! Any other inbound frame is ignored.

use super::DeviceError;
use crate::bridge::Device;
use crate::protocol::DataPoints;
use crate::transport::DeviceEvent;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct Hello<'a> {
    id: &'a str,
    key: &'a str,
    version: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Outbound<'a> {
    Hello(Hello<'a>),
    Refresh(bool),
    Set(&'a DataPoints),
}

#[derive(Deserialize)]
struct Inbound {
    dps: Option<DataPoints>,
    #[serde(default)]
    refresh: bool,
}

fn encode(frame: &Outbound<'_>) -> Result<String, DeviceError> {
    let mut line = serde_json::to_string(frame).map_err(DeviceError::Serialization)?;
    line.push('\n');
    Ok(line)
}

/// Handshake frame carrying the device credentials
pub fn hello(device: &Device) -> Result<String, DeviceError> {
    encode(&Outbound::Hello(Hello {
        id: &device.id,
        key: &device.key,
        version: &device.version,
    }))
}

/// Request a full data-point report
pub fn refresh() -> Result<String, DeviceError> {
    encode(&Outbound::Refresh(true))
}

/// Data-point command
pub fn set(command: &DataPoints) -> Result<String, DeviceError> {
    encode(&Outbound::Set(command))
}

/// Decode one inbound line; `Ok(None)` for frames that carry no data points
pub fn parse(line: &str) -> Result<Option<DeviceEvent>, DeviceError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let inbound: Inbound = serde_json::from_str(line).map_err(DeviceError::InvalidFrame)?;
    Ok(inbound.dps.map(|dps| {
        if inbound.refresh {
            DeviceEvent::DataRefresh(dps)
        } else {
            DeviceEvent::Data(dps)
        }
    }))
}
