//! Handoff configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the hinted handoff service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Whether hinted handoff is enabled. When disabled the service accepts
    /// open/close but rejects writes.
    pub enabled: bool,

    /// Root directory for per-node queue data.
    pub dir: PathBuf,

    /// Per-queue disk budget in bytes. Oldest sealed segments are evicted
    /// once a queue grows past this.
    pub max_size: u64,

    /// Size in bytes at which the active segment is sealed and a new one
    /// started.
    pub segment_size: u64,

    /// Minimum idle age in milliseconds before the queue of a departed node
    /// may be purged.
    pub max_age_ms: u64,

    /// First replay backoff delay in milliseconds after a failed delivery.
    pub retry_initial_backoff_ms: u64,

    /// Upper bound in milliseconds for the exponential replay backoff.
    pub retry_max_backoff_ms: u64,

    /// Period in milliseconds of the inactive-queue purge task.
    pub purge_interval_ms: u64,

    /// Deadline in milliseconds applied to each shard writer call.
    pub write_timeout_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./handoff"),
            // 1GiB per destination before eviction kicks in
            max_size: 1024 * 1024 * 1024,
            // 10MiB segments
            segment_size: 10 * 1024 * 1024,
            // A week of grace before a departed node's data may be purged
            max_age_ms: 7 * 24 * 60 * 60 * 1000,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 10_000,
            // Purge hourly
            purge_interval_ms: 60 * 60 * 1000,
            write_timeout_ms: 10_000,
        }
    }
}

impl HandoffConfig {
    /// Create a new configuration builder.
    pub fn builder() -> HandoffConfigBuilder {
        HandoffConfigBuilder::default()
    }

    /// Get the purge idle age as a Duration.
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    /// Get the initial replay backoff as a Duration.
    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    /// Get the replay backoff cap as a Duration.
    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    /// Get the purge task period as a Duration.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    /// Get the shard writer deadline as a Duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_size == 0 {
            return Err("segment_size must be > 0".to_string());
        }

        if self.max_size < self.segment_size {
            return Err(format!(
                "max_size ({}) must be >= segment_size ({})",
                self.max_size, self.segment_size
            ));
        }

        if self.retry_initial_backoff_ms == 0 {
            return Err("retry_initial_backoff_ms must be > 0".to_string());
        }

        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms {
            return Err(format!(
                "retry_max_backoff_ms ({}) must be >= retry_initial_backoff_ms ({})",
                self.retry_max_backoff_ms, self.retry_initial_backoff_ms
            ));
        }

        if self.purge_interval_ms == 0 {
            return Err("purge_interval_ms must be > 0".to_string());
        }

        if self.write_timeout_ms == 0 {
            return Err("write_timeout_ms must be > 0".to_string());
        }

        Ok(())
    }
}

/// Builder for `HandoffConfig`.
#[derive(Debug, Default)]
pub struct HandoffConfigBuilder {
    config: HandoffConfig,
}

impl HandoffConfigBuilder {
    /// Enable or disable hinted handoff.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set the root data directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.dir = dir.into();
        self
    }

    /// Set the per-queue disk budget in bytes.
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.config.max_size = bytes;
        self
    }

    /// Set the segment rotation size in bytes.
    pub fn segment_size(mut self, bytes: u64) -> Self {
        self.config.segment_size = bytes;
        self
    }

    /// Set the purge idle age in milliseconds.
    pub fn max_age_ms(mut self, ms: u64) -> Self {
        self.config.max_age_ms = ms;
        self
    }

    /// Set the replay backoff envelope in milliseconds.
    pub fn retry_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.retry_initial_backoff_ms = initial;
        self.config.retry_max_backoff_ms = max;
        self
    }

    /// Set the purge task period in milliseconds.
    pub fn purge_interval_ms(mut self, ms: u64) -> Self {
        self.config.purge_interval_ms = ms;
        self
    }

    /// Set the shard writer deadline in milliseconds.
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<HandoffConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(HandoffConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let config = HandoffConfig::builder()
            .enabled(false)
            .dir("/var/lib/strata/hh")
            .max_size(64 * 1024)
            .segment_size(8 * 1024)
            .retry_backoff_ms(50, 500)
            .build()
            .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.dir, PathBuf::from("/var/lib/strata/hh"));
        assert_eq!(config.max_size, 64 * 1024);
        assert_eq!(config.retry_initial_backoff(), Duration::from_millis(50));
        assert_eq!(config.retry_max_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_segment_larger_than_budget() {
        let err = HandoffConfig::builder()
            .max_size(1024)
            .segment_size(4096)
            .build()
            .unwrap_err();
        assert!(err.contains("max_size"));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let err = HandoffConfig::builder()
            .retry_backoff_ms(1000, 100)
            .build()
            .unwrap_err();
        assert!(err.contains("retry_max_backoff_ms"));
    }
}
