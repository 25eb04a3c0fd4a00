//! Replication configuration.

use crate::error::{CoreError, CoreResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by every replicator on a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Whether secondaries replicate at all.
    pub replication_enabled: bool,
    /// Whether checksums are computed and compared.
    pub verification_enabled: bool,
    /// Rows claimed per verification batch.
    pub verification_batch_size: usize,
    /// Rows marked for reverification per pass.
    pub reverification_batch_size: usize,
    /// Rows created or removed per backfill pass.
    pub backfill_batch_size: usize,
    /// Rows claimed per sync batch.
    pub sync_batch_size: usize,
    /// How long a row may stay in `verification_started`.
    #[serde(with = "duration_secs")]
    pub verification_timeout: Duration,
    /// How long a row may stay in `started`.
    #[serde(with = "duration_secs")]
    pub sync_timeout: Duration,
    /// Minimum age of a successful verification before it is redone.
    #[serde(with = "duration_secs")]
    pub minimum_reverification_interval: Duration,
    /// Repository syncs between maintenance runs.
    pub repository_maintenance_interval: u32,
    /// Backoff policy for failed syncs and verifications.
    pub retry: RetryPolicy,
}

impl ReplicationConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            replication_enabled: true,
            verification_enabled: true,
            verification_batch_size: 10,
            reverification_batch_size: 1000,
            backfill_batch_size: 10_000,
            sync_batch_size: 10,
            verification_timeout: Duration::from_secs(8 * 60 * 60),
            sync_timeout: Duration::from_secs(8 * 60 * 60),
            minimum_reverification_interval: Duration::from_secs(90 * 24 * 60 * 60),
            repository_maintenance_interval: 10,
            retry: RetryPolicy::default(),
        }
    }

    /// Enables or disables replication.
    pub fn with_replication_enabled(mut self, enabled: bool) -> Self {
        self.replication_enabled = enabled;
        self
    }

    /// Enables or disables verification.
    pub fn with_verification_enabled(mut self, enabled: bool) -> Self {
        self.verification_enabled = enabled;
        self
    }

    /// Sets the verification batch size.
    pub fn with_verification_batch_size(mut self, size: usize) -> Self {
        self.verification_batch_size = size;
        self
    }

    /// Sets the reverification batch size.
    pub fn with_reverification_batch_size(mut self, size: usize) -> Self {
        self.reverification_batch_size = size;
        self
    }

    /// Sets the backfill batch size.
    pub fn with_backfill_batch_size(mut self, size: usize) -> Self {
        self.backfill_batch_size = size;
        self
    }

    /// Sets the sync batch size.
    pub fn with_sync_batch_size(mut self, size: usize) -> Self {
        self.sync_batch_size = size;
        self
    }

    /// Sets the verification timeout.
    pub fn with_verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout = timeout;
        self
    }

    /// Sets the sync timeout.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Sets the minimum reverification interval.
    pub fn with_minimum_reverification_interval(mut self, interval: Duration) -> Self {
        self.minimum_reverification_interval = interval;
        self
    }

    /// Sets the number of repository syncs between maintenance runs.
    pub fn with_repository_maintenance_interval(mut self, syncs: u32) -> Self {
        self.repository_maintenance_interval = syncs;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> CoreResult<()> {
        let sizes = [
            ("verification_batch_size", self.verification_batch_size),
            ("reverification_batch_size", self.reverification_batch_size),
            ("backfill_batch_size", self.backfill_batch_size),
            ("sync_batch_size", self.sync_batch_size),
        ];
        for (name, size) in sizes {
            if size == 0 {
                return Err(CoreError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.verification_timeout.is_zero() || self.sync_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("timeouts must be positive".into()));
        }
        if self.retry.max_delay > self.retry.extended_max_delay {
            return Err(CoreError::InvalidConfig(
                "retry.max_delay must not exceed retry.extended_max_delay".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable form of a timeout for failure messages, e.g. `8 hours`.
pub fn describe_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (value, unit) = if secs >= 3600 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs >= 60 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };
    if value == 1 {
        format!("1 {unit}")
    } else {
        format!("{value} {unit}s")
    }
}

/// Serializes a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.verification_batch_size, 10);
        assert_eq!(config.reverification_batch_size, 1000);
        assert_eq!(config.backfill_batch_size, 10_000);
        assert_eq!(config.verification_timeout, Duration::from_secs(8 * 3600));
        assert_eq!(config.retry.extended_max_delay, Duration::from_secs(4 * 3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder() {
        let config = ReplicationConfig::new()
            .with_verification_batch_size(3)
            .with_sync_batch_size(7)
            .with_verification_enabled(false)
            .with_sync_timeout(Duration::from_secs(60));

        assert_eq!(config.verification_batch_size, 3);
        assert_eq!(config.sync_batch_size, 7);
        assert!(!config.verification_enabled);
        assert_eq!(config.sync_timeout, Duration::from_secs(60));
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let config = ReplicationConfig::new().with_sync_batch_size(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync_batch_size"));
    }

    #[test]
    fn validate_rejects_inverted_caps() {
        let retry = RetryPolicy::new().with_max_delay(Duration::from_secs(5 * 3600));
        assert!(ReplicationConfig::new().with_retry(retry).validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: ReplicationConfig =
            serde_json::from_str(r#"{"verification_batch_size": 25, "sync_timeout": 600}"#).unwrap();
        assert_eq!(config.verification_batch_size, 25);
        assert_eq!(config.sync_timeout, Duration::from_secs(600));
        assert_eq!(config.backfill_batch_size, 10_000);
    }

    #[test]
    fn describe_durations() {
        assert_eq!(describe_duration(Duration::from_secs(8 * 3600)), "8 hours");
        assert_eq!(describe_duration(Duration::from_secs(3600)), "1 hour");
        assert_eq!(describe_duration(Duration::from_secs(90)), "90 seconds");
        assert_eq!(describe_duration(Duration::from_secs(120)), "2 minutes");
    }
}
