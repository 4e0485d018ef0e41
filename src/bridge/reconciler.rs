//! Periodic self-healing
//!
//! Every tick republishes every device and asks each device whose link
//! reports down to reconnect. Retries are unbounded and have no backoff;
//! the next tick is the retry.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Default reconcile period
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15);

/// Work for one reconciliation tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Devices to republish, all of them
    pub republish: Vec<usize>,
    /// Devices whose link is down
    pub reconnect: Vec<usize>,
}

/// Schedules reconciliation ticks
#[derive(Debug, Clone)]
pub struct Reconciler {
    period: Duration,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_RECONCILE_INTERVAL)
    }
}

impl Reconciler {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Timer whose first tick fires one period from now
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Plan a tick from each device's connectivity flag, in device order
    pub fn plan<I>(&self, connected_flags: I) -> ReconcilePlan
    where
        I: IntoIterator<Item = bool>,
    {
        let mut plan = ReconcilePlan::default();
        for (index, connected) in connected_flags.into_iter().enumerate() {
            plan.republish.push(index);
            if !connected {
                plan.reconnect.push(index);
            }
        }
        plan
    }
}
