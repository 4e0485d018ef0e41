//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - structured JSON for production and log aggregation
//! - `pretty` - multi-line, colored output for development
//! - `compact` - colored single-line terminal output
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty, compact - defaults to json
//! - `LOG_SPANS`: include span open/close events (true/false) - defaults to false
//! - `LOG_FILE`: also write plain-text lines to this file - unset by default
//! - `LOG_FILE_MAX_BYTES`: size at which `LOG_FILE` rotates - defaults to 1000000
//! - `RUST_LOG`: overrides filtering entirely (env_logger syntax)
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG LOG_FILE=app.log tuya2mqtt run
//! ```
//!
//! Panics are routed through the subscriber by [`install_panic_hook`], so
//! they reach the log file as well.

use super::log_file::{SizeCappedFile, DEFAULT_MAX_LOG_BYTES};
use std::any::Any;
use std::env;
use tracing::{error, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies kept quiet unless RUST_LOG says otherwise
const DEPENDENCY_DIRECTIVES: &[&str] = &["rumqttc=warn", "tokio=warn", "mio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string, falling back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value, falling back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Parse a `LOG_SPANS` value; only "true" enables span events
pub fn parse_span_flag(s: &str) -> bool {
    s.eq_ignore_ascii_case("true")
}

/// Parse a `LOG_FILE_MAX_BYTES` value, falling back to the default cap
pub fn parse_max_bytes(s: &str) -> u64 {
    match s.trim().parse::<u64>() {
        Ok(bytes) if bytes > 0 => bytes,
        _ => DEFAULT_MAX_LOG_BYTES,
    }
}

/// Filter for `level` with dependency noise reduced, or RUST_LOG if set
pub fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    DEPENDENCY_DIRECTIVES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration.
///
/// With a `log_file`, lines are also written there through a background
/// writer; keep the returned guard alive until exit so they are flushed.
pub fn init_logging(
    level: Level,
    format: LogFormat,
    include_spans: bool,
    log_file: Option<SizeCappedFile>,
) -> Option<WorkerGuard> {
    let console = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events(include_spans))
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(true)
            .with_span_events(span_events(include_spans))
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(true)
            .with_target(false)
            .with_span_events(span_events(include_spans))
            .boxed(),
    };

    let (file_layer, guard) = match log_file {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(console)
        .with(file_layer)
        .init();

    guard
}

/// Initialize logging from environment variables and install the panic hook
pub fn init_default_logging() -> Option<WorkerGuard> {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = parse_span_flag(&env::var("LOG_SPANS").unwrap_or_default());
    let max_bytes = parse_max_bytes(&env::var("LOG_FILE_MAX_BYTES").unwrap_or_default());

    let (log_file, file_error) = match env::var("LOG_FILE") {
        Ok(path) if !path.is_empty() => match SizeCappedFile::open(&path, max_bytes) {
            Ok(file) => (Some(file), None),
            Err(e) => (None, Some((path, e))),
        },
        _ => (None, None),
    };

    let guard = init_logging(level, format, include_spans, log_file);
    install_panic_hook();

    if let Some((path, e)) = file_error {
        warn!(path = %path, "Cannot open log file, logging to console only: {}", e);
    }
    guard
}

/// Log panics through tracing instead of raw stderr
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|location| format!("{}:{}", location.file(), location.line()))
            .unwrap_or_default();
        error!(location = %location, "Uncaught panic: {}", panic_message(info.payload()));
    }));
}

/// Text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Span around one pass of the bridge event loop
#[macro_export]
macro_rules! bridge_span {
    ($($field:tt)*) => {
        tracing::info_span!("bridge_event", $($field)*)
    };
}

/// Span around handling an event of one device
#[macro_export]
macro_rules! device_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_event", $($field)*)
    };
}

/// Span around a broker link operation
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

pub use {bridge_span, device_span, mqtt_span};
