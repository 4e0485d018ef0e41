//! Connection lifecycle tracking
//!
//! One [`LinkTracker`] per link (the broker link and each device link)
//! turns raw connect/close signals into a five-state lifecycle:
//!
//! | State        | connect      | close        |
//! |--------------|--------------|--------------|
//! | Unknown      | Connected    | Unconnected  |
//! | Unconnected  | Connected    | -            |
//! | Connected    | -            | Disconnected |
//! | Disconnected | Reconnected  | -            |
//! | Reconnected  | -            | Disconnected |
//!
//! Cells marked `-` leave the state unchanged and are not reported.

use std::fmt;
use tracing::info;

/// Lifecycle state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    #[default]
    Unknown,
    Unconnected,
    Connected,
    Disconnected,
    Reconnected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Unknown => "unknown",
            LinkState::Unconnected => "unconnected",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Reconnected => "reconnected",
        }
    }

    /// Connected or Reconnected
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Reconnected)
    }

    /// Next state for a signal, `None` when the signal is a no-op here
    pub fn next(self, signal: LinkSignal) -> Option<LinkState> {
        use LinkSignal::*;
        use LinkState::*;

        match (self, signal) {
            (Unknown, Connect) | (Unconnected, Connect) => Some(Connected),
            (Unknown, Close) => Some(Unconnected),
            (Connected, Close) | (Reconnected, Close) => Some(Disconnected),
            (Disconnected, Connect) => Some(Reconnected),
            (Unconnected, Close)
            | (Connected, Connect)
            | (Disconnected, Close)
            | (Reconnected, Connect) => None,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw signal reported by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Connect,
    Close,
}

/// Lifecycle state machine for a single link
#[derive(Debug, Clone)]
pub struct LinkTracker {
    label: String,
    state: LinkState,
}

impl LinkTracker {
    /// New tracker in [`LinkState::Unknown`]; `label` names the link in logs
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
            state: LinkState::Unknown,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Apply a signal. Returns the new state on an actual transition.
    pub fn apply(&mut self, signal: LinkSignal) -> Option<LinkState> {
        let next = self.state.next(signal)?;
        info!(link = %self.label, from = %self.state, state = %next, "Link state changed");
        self.state = next;
        Some(next)
    }
}
