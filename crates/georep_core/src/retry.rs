//! Retry backoff.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy shared by the sync and verification state machines.
///
/// The delay for attempt `n` is `n^4` seconds plus `base_delay`, with up to
/// ten percent random jitter added, capped at `max_delay` (or
/// `extended_max_delay` for resources missing on the primary). Once the
/// un-jittered delay reaches the cap the delay is exactly the cap, so the
/// sequence of delays never decreases as attempts grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Constant added to every delay.
    #[serde(with = "crate::config::duration_secs")]
    pub base_delay: Duration,
    /// Default maximum delay.
    #[serde(with = "crate::config::duration_secs")]
    pub max_delay: Duration,
    /// Maximum delay for resources missing on the primary.
    #[serde(with = "crate::config::duration_secs")]
    pub extended_max_delay: Duration,
    /// Whether to add random jitter.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Creates the default policy: 15 s base, 1 h cap, 4 h extended cap.
    pub fn new() -> Self {
        Self {
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(60 * 60),
            extended_max_delay: Duration::from_secs(4 * 60 * 60),
            jitter: true,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the default cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the extended cap.
    pub fn with_extended_max_delay(mut self, delay: Duration) -> Self {
        self.extended_max_delay = delay;
        self
    }

    /// Disables jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the cap that applies.
    pub fn cap(&self, extended: bool) -> Duration {
        if extended {
            self.extended_max_delay
        } else {
            self.max_delay
        }
    }

    /// Returns the un-jittered, uncapped delay for `attempt`.
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let n = u64::from(attempt.max(1));
        let secs = n.saturating_pow(4);
        Duration::from_secs(secs).saturating_add(self.base_delay)
    }

    /// Returns the delay before retry number `attempt`.
    pub fn delay(&self, attempt: u32, extended: bool) -> Duration {
        let base = self.base_delay_for(attempt);
        let cap = self.cap(extended);
        if base >= cap {
            return cap;
        }

        let delay = if self.jitter {
            let max_jitter_ms = u64::try_from(base.as_millis() / 10).unwrap_or(u64::MAX);
            let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
            base.saturating_add(Duration::from_millis(jitter_ms))
        } else {
            base
        };
        delay.min(cap)
    }

    /// Returns the time at which retry number `attempt` is due.
    ///
    /// Never earlier than `now`.
    pub fn next_retry_time(&self, attempt: u32, extended: bool, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay(attempt, extended);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_attempt_starts_at_base() {
        let policy = RetryPolicy::new().without_jitter();
        assert_eq!(policy.delay(1, false), Duration::from_secs(16));
        assert_eq!(policy.delay(0, false), Duration::from_secs(16));
        assert_eq!(policy.delay(2, false), Duration::from_secs(31));
    }

    #[test]
    fn default_cap_is_one_hour() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.delay(31, false), Duration::from_secs(3600));
        assert_eq!(policy.delay(u32::MAX, false), Duration::from_secs(3600));
    }

    #[test]
    fn extended_cap_is_four_hours() {
        let policy = RetryPolicy::new();
        let delay = policy.delay(50, true);
        assert_eq!(delay, Duration::from_secs(4 * 3600));
        assert!(policy.delay(9, true) > policy.delay(9, false));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::new();
        for _ in 0..100 {
            let delay = policy.delay(3, false);
            assert!(delay >= Duration::from_secs(96));
            assert!(delay <= Duration::from_millis(96_000 + 9_600));
        }
    }

    #[test]
    fn next_retry_time_is_in_the_future() {
        let now = Utc::now();
        let at = RetryPolicy::new().next_retry_time(1, false, now);
        assert!(at > now);
        assert!(at <= now + chrono::Duration::seconds(18));
    }

    #[test]
    fn serde_uses_seconds() {
        let json = serde_json::to_value(RetryPolicy::new()).unwrap();
        assert_eq!(json["max_delay"], 3600);
        let parsed: RetryPolicy = serde_json::from_str(r#"{"max_delay": 120}"#).unwrap();
        assert_eq!(parsed.max_delay, Duration::from_secs(120));
        assert_eq!(parsed.base_delay, Duration::from_secs(15));
    }

    proptest! {
        #[test]
        fn delays_never_decrease(attempt in 1u32..200, extended in any::<bool>()) {
            let policy = RetryPolicy::new();
            // Worst case for attempt vs best case for attempt + 1.
            let base = policy.base_delay_for(attempt);
            let cap = policy.cap(extended);
            let upper = base.saturating_add(base / 10).min(cap);
            let next_lower = policy.base_delay_for(attempt + 1).min(cap);
            prop_assert!(upper <= next_lower || upper == cap);
            prop_assert!(policy.delay(attempt, extended) <= upper);
        }

        #[test]
        fn delay_never_exceeds_cap(attempt in any::<u32>(), extended in any::<bool>()) {
            let policy = RetryPolicy::new();
            prop_assert!(policy.delay(attempt, extended) <= policy.cap(extended));
        }
    }
}
