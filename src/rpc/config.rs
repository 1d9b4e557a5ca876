use std::time::Duration;

use crate::common::{DEFAULT_K, DEFAULT_MAX_FAILURES, DEFAULT_REPLACEMENT_CACHE_SIZE};

/// Number of parallel requests per lookup round.
pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

/// Time to live of a stored value since its last publication.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(86400);
/// Buckets without activity for this long are refreshed.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
/// Interval between replications of every stored value.
pub const REPLICATE_INTERVAL: Duration = Duration::from_secs(3600);
/// Interval between republications of locally published values.
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(86400);
/// Interval between sweeps of expired values.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_STORAGE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bucket size and lookup result size.
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// Lookup concurrency, the number of requests in flight per round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Candidates kept per bucket to replace evicted contacts.
    ///
    /// Defaults to [DEFAULT_REPLACEMENT_CACHE_SIZE]
    pub replacement_cache_size: usize,
    /// Consecutive failed requests before a contact is evicted.
    ///
    /// Defaults to [DEFAULT_MAX_FAILURES]
    pub max_failures: u8,
    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookup rounds take.
    /// The shorter it is, the more responses from busy nodes we miss out on,
    /// which affects the accuracy of lookups.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Defaults to [REFRESH_INTERVAL]
    pub refresh_interval: Duration,
    /// Defaults to [REPLICATE_INTERVAL]
    pub replicate_interval: Duration,
    /// Defaults to [REPUBLISH_INTERVAL]
    pub republish_interval: Duration,
    /// Defaults to [EXPIRE_INTERVAL]
    pub expire_interval: Duration,
    /// Defaults to [SWEEP_INTERVAL]
    pub sweep_interval: Duration,
    /// Maximum number of values held by the default storage.
    ///
    /// Defaults to [DEFAULT_STORAGE_CAPACITY]
    pub storage_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            replacement_cache_size: DEFAULT_REPLACEMENT_CACHE_SIZE,
            max_failures: DEFAULT_MAX_FAILURES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_interval: REFRESH_INTERVAL,
            replicate_interval: REPLICATE_INTERVAL,
            republish_interval: REPUBLISH_INTERVAL,
            expire_interval: EXPIRE_INTERVAL,
            sweep_interval: SWEEP_INTERVAL,
            storage_capacity: DEFAULT_STORAGE_CAPACITY,
        }
    }
}
