//! Configuration for the sync engine.
//!
//! Configurations can be built in code with the `with_*` methods or loaded
//! from JSON. Durations are written as milliseconds in JSON.

use crate::error::{SyncError, SyncResult};
use possync_protocol::{Collection, DeviceId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Device ID (unique per device).
    pub device_id: DeviceId,
    /// Collections kept in sync, in dependency order.
    pub collections: Vec<Collection>,
    /// Period of the background smart sync.
    #[serde(with = "millis")]
    pub sync_interval: Duration,
    /// A successful sync older than this makes `needs_sync` true.
    #[serde(with = "millis")]
    pub stale_after: Duration,
    /// Period of presence heartbeats.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Devices silent for this many heartbeat intervals are inactive.
    pub heartbeat_ttl_multiplier: u32,
    /// Age after which tombstones are purged.
    #[serde(with = "millis")]
    pub tombstone_retention: Duration,
    /// Period of the tombstone reaper.
    #[serde(with = "millis")]
    pub reaper_interval: Duration,
    /// Minimum pause before a dropped listener resubscribes.
    #[serde(with = "millis")]
    pub resubscribe_delay: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default timings for `device_id`.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            collections: Collection::DOMAIN.to_vec(),
            sync_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_ttl_multiplier: 3,
            tombstone_retention: Duration::from_secs(30 * 24 * 60 * 60),
            reaper_interval: Duration::from_secs(6 * 60 * 60),
            resubscribe_delay: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }

    /// Loads a configuration from a JSON file.
    ///
    /// Missing keys take their default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Parses a configuration from JSON text.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(c) = self.collections.iter().find(|c| !c.is_domain()) {
            return Err(SyncError::Config(format!("{c} cannot be synced as a domain collection")));
        }
        if self.sync_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(SyncError::Config("intervals must be positive".into()));
        }
        if self.heartbeat_ttl_multiplier == 0 {
            return Err(SyncError::Config("heartbeatTtlMultiplier must be at least 1".into()));
        }
        Ok(())
    }

    /// Time after which a silent device is considered inactive.
    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_ttl_multiplier
    }

    /// Sets the device ID.
    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }

    /// Sets the synced collections.
    pub fn with_collections(mut self, collections: impl IntoIterator<Item = Collection>) -> Self {
        self.collections = collections.into_iter().collect();
        self
    }

    /// Sets the background sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the tombstone retention.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// Sets the reaper interval.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets the listener resubscribe delay.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DeviceId::generate())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before retry `attempt` (0 is the first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
