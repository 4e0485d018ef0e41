//! Observability: structured logging setup, log file sink and span helpers

pub mod log_file;
pub mod logging;

pub use log_file::{SizeCappedFile, DEFAULT_MAX_LOG_BYTES};
pub use logging::{
    init_default_logging, init_logging, install_panic_hook, panic_message, LogFormat,
};

// Span macros for structured logging
pub use logging::{bridge_span, device_span, mqtt_span};
