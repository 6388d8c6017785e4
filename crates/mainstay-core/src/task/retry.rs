//! Retry policy
//!
//! Exponential backoff: attempt `k` (1-based) waits
//! `delay * backoff^(k-1)`, bounded at 600 seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on a single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

/// Configuration for task retries.
///
/// # Example
///
/// ```
/// use mainstay_core::task::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .with_max_attempts(3)
///     .with_delay(Duration::from_secs(1))
///     .with_backoff(2.0);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retry attempts after the initial one. Zero disables retries.
    pub max_attempts: u32,

    /// Base delay before the first retry.
    #[serde(with = "duration_secs")]
    pub delay: Duration,

    /// Backoff multiplier applied per retry.
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::from_secs(1),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff.max(1.0);
        self
    }

    pub fn enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before the given retry attempt (1-based), capped at
    /// [`MAX_RETRY_DELAY`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let secs = self.delay.as_secs_f64() * self.backoff.powi(exponent as i32);
        Duration::from_secs_f64(secs.min(MAX_RETRY_DELAY.as_secs_f64()))
    }
}

/// Serde support for Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.enabled());
        assert_eq!(policy.delay, Duration::from_secs(1));
        assert_eq!(policy.backoff, 2.0);
    }

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_delay(Duration::from_secs(2))
            .with_backoff(3.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(6));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(18));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new()
            .with_max_attempts(30)
            .with_delay(Duration::from_secs(10))
            .with_backoff(2.0);

        assert_eq!(policy.delay_for_attempt(20), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_backoff_floor_is_one() {
        let policy = RetryPolicy::new().with_backoff(0.1);
        assert_eq!(policy.backoff, 1.0);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let policy = RetryPolicy::new()
            .with_max_attempts(3)
            .with_delay(Duration::from_secs(5));

        let encoded = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&encoded).unwrap();
        assert_eq!(policy, parsed);
    }
}
