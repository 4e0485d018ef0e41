//! Broker-facing protocol: topic scheme and payload shapes
//!
//! Defines how device state is laid out on the broker and how inbound
//! commands are recognised.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
