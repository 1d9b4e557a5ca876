//! Periodic maintenance timers.

use std::time::{Duration, Instant};

use crate::common::RoutingTable;
use crate::rpc::Config;

/// Maintenance timer state
#[derive(Debug)]
pub struct Scheduler {
    refresh_interval: Duration,
    replicate_interval: Duration,
    republish_interval: Duration,
    sweep_interval: Duration,

    last_replicate: Instant,
    last_republish: Instant,
    last_sweep: Instant,
}

/// Maintenance tasks that are due
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MaintenanceTasks {
    /// Indexes of buckets without a lookup within the refresh interval
    pub buckets_to_refresh: Vec<usize>,

    /// Whether to send every stored value to the nodes closest to its key
    pub replicate: bool,

    /// Whether to publish locally put values again
    pub republish: bool,

    /// Whether to drop expired values
    pub sweep: bool,
}

impl MaintenanceTasks {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Scheduler {
    /// Create new scheduler, with all timers starting now.
    pub fn new(config: &Config) -> Self {
        Self::starting_at(config, Instant::now())
    }

    pub fn starting_at(config: &Config, now: Instant) -> Self {
        Scheduler {
            refresh_interval: config.refresh_interval,
            replicate_interval: config.replicate_interval,
            republish_interval: config.republish_interval,
            sweep_interval: config.sweep_interval,

            last_replicate: now,
            last_republish: now,
            last_sweep: now,
        }
    }

    /// Determine which maintenance tasks are due at `now`.
    ///
    /// Timers of due tasks reset to `now`. Bucket refresh timers live in the
    /// buckets themselves and reset when the refresh lookup touches them.
    pub fn due(&mut self, now: Instant, routing_table: &RoutingTable) -> MaintenanceTasks {
        MaintenanceTasks {
            buckets_to_refresh: routing_table.stale_buckets(now, self.refresh_interval),
            replicate: Self::elapsed(&mut self.last_replicate, self.replicate_interval, now),
            republish: Self::elapsed(&mut self.last_republish, self.republish_interval, now),
            sweep: Self::elapsed(&mut self.last_sweep, self.sweep_interval, now),
        }
    }

    fn elapsed(last: &mut Instant, interval: Duration, now: Instant) -> bool {
        if now.saturating_duration_since(*last) >= interval {
            *last = now;
            true
        } else {
            false
        }
    }
}
