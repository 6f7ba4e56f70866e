//! Storage configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_millis::duration_millis;

/// Shortest reaper interval; a zero period cannot drive a ticker
pub(crate) const MIN_REAPER_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for [`PersistentStorage`](super::PersistentStorage)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Default lifetime of a response nobody waits for
    #[serde(with = "duration_millis")]
    pub stale_response_removal_timeout: Duration,

    /// How often the stale-response reaper runs
    #[serde(with = "duration_millis")]
    pub delete_stale_responses_interval: Duration,

    /// Maximum instances promoted per queue-updater transaction
    pub queue_update_batch: usize,

    /// Maximum responses deleted per reaper transaction
    pub stale_response_delete_batch: usize,

    /// Purge finished instances instead of keeping them
    pub remove_when_finished: bool,

    /// Queue-updater sleep policy
    pub queue_backoff: QueueBackoff,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            stale_response_removal_timeout: Duration::from_secs(60 * 60),
            delete_stale_responses_interval: Duration::from_secs(60 * 60),
            queue_update_batch: 5000,
            stale_response_delete_batch: 20000,
            remove_when_finished: false,
            queue_backoff: QueueBackoff::default(),
        }
    }
}

impl StorageConfig {
    /// Read overrides from `DISPATCH_*` environment variables
    ///
    /// Unset or unparsable variables keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stale_response_removal_timeout: env_millis(
                "DISPATCH_STALE_RESPONSE_TIMEOUT_MS",
                defaults.stale_response_removal_timeout,
            ),
            delete_stale_responses_interval: env_millis(
                "DISPATCH_STALE_RESPONSE_INTERVAL_MS",
                defaults.delete_stale_responses_interval,
            )
            .max(MIN_REAPER_INTERVAL),
            queue_update_batch: env_parse("DISPATCH_QUEUE_UPDATE_BATCH", defaults.queue_update_batch),
            stale_response_delete_batch: env_parse(
                "DISPATCH_STALE_RESPONSE_DELETE_BATCH",
                defaults.stale_response_delete_batch,
            ),
            remove_when_finished: env_parse(
                "DISPATCH_REMOVE_WHEN_FINISHED",
                defaults.remove_when_finished,
            ),
            queue_backoff: defaults.queue_backoff,
        }
    }

    pub fn with_stale_response_removal_timeout(mut self, timeout: Duration) -> Self {
        self.stale_response_removal_timeout = timeout;
        self
    }

    pub fn with_delete_stale_responses_interval(mut self, interval: Duration) -> Self {
        self.delete_stale_responses_interval = interval.max(MIN_REAPER_INTERVAL);
        self
    }

    pub fn with_queue_update_batch(mut self, batch: usize) -> Self {
        self.queue_update_batch = batch.max(1);
        self
    }

    pub fn with_remove_when_finished(mut self, remove: bool) -> Self {
        self.remove_when_finished = remove;
        self
    }

    pub fn with_queue_backoff(mut self, backoff: QueueBackoff) -> Self {
        self.queue_backoff = backoff;
        self
    }
}

/// Sleep policy of the queue updater
///
/// A pass that promoted nothing waits longest; a pass that hit the batch
/// ceiling runs again immediately.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use durable_dispatch::persistence::QueueBackoff;
///
/// let backoff = QueueBackoff::default();
/// assert_eq!(backoff.delay_for(0, 5000), Duration::from_secs(2));
/// assert_eq!(backoff.delay_for(10, 5000), Duration::from_secs(1));
/// assert_eq!(backoff.delay_for(5000, 5000), Duration::ZERO);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBackoff {
    /// Sleep after a pass that promoted nothing
    #[serde(with = "duration_millis")]
    pub empty: Duration,

    /// Sleep after a pass below the batch ceiling
    #[serde(with = "duration_millis")]
    pub partial: Duration,

    /// Sleep after a pass that hit the batch ceiling
    #[serde(with = "duration_millis")]
    pub full: Duration,
}

impl Default for QueueBackoff {
    fn default() -> Self {
        Self {
            empty: Duration::from_secs(2),
            partial: Duration::from_secs(1),
            full: Duration::ZERO,
        }
    }
}

impl QueueBackoff {
    /// Delay before the next pass, given how many rows this pass promoted
    pub fn delay_for(&self, promoted: usize, ceiling: usize) -> Duration {
        if promoted == 0 {
            self.empty
        } else if promoted >= ceiling {
            self.full
        } else {
            self.partial
        }
    }
}

/// Configuration for the batching command writer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Maximum commands per transaction
    pub max_batch_size: usize,

    /// How long a partial batch waits for more commands
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,

    /// Bound of the submission queue
    pub queue_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_millis(10),
            queue_capacity: 10_000,
        }
    }
}

impl BatcherConfig {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.stale_response_removal_timeout, Duration::from_secs(3600));
        assert_eq!(config.delete_stale_responses_interval, Duration::from_secs(3600));
        assert_eq!(config.queue_update_batch, 5000);
        assert_eq!(config.stale_response_delete_batch, 20000);
        assert!(!config.remove_when_finished);
    }

    #[test]
    fn test_zero_reaper_interval_is_clamped() {
        let config = StorageConfig::default().with_delete_stale_responses_interval(Duration::ZERO);
        assert_eq!(config.delete_stale_responses_interval, MIN_REAPER_INTERVAL);
    }

    #[test]
    fn test_backoff_tiers() {
        let backoff = QueueBackoff::default();
        assert_eq!(backoff.delay_for(0, 100), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(1, 100), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(99, 100), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(100, 100), Duration::ZERO);
    }

    #[test]
    fn test_config_serializes_millis() {
        let json = serde_json::to_value(BatcherConfig::default()).unwrap();
        assert_eq!(json["flush_interval"], 10);
        assert_eq!(json["max_batch_size"], 100);
    }
}
