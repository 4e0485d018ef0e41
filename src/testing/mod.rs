//! Testing utilities and mock implementations
//!
//! Mocks for the broker and device collaborators so the bridge can be driven
//! without a broker or real devices.

pub mod mocks;

pub use mocks::*;
