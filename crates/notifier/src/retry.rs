//! Exponential backoff for transient provider failures.

use std::time::Duration;

use beacon_common::config::AppConfig;

/// Backoff settings for one delivery attempt.
///
/// `max_attempts` counts provider calls, the first one included, so an
/// attempt may be retried `max_attempts - 1` times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    RetryAfter(Duration),
    Exhausted,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            multiplier: config.retry_multiplier.max(1.0),
            max_attempts: config.retry_max_attempts.max(1),
        }
    }

    /// Retries allowed per attempt, stored as `max_retries` on the row.
    pub fn max_retries(&self) -> i32 {
        i32::try_from(self.max_attempts.saturating_sub(1)).unwrap_or(i32::MAX)
    }

    /// Delay before retry number `retry` (1-based): `base × multiplier^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Decide the next step after `calls_made` failed provider calls.
    pub fn next(&self, calls_made: u32) -> Backoff {
        if calls_made >= self.max_attempts {
            Backoff::Exhausted
        } else {
            Backoff::RetryAfter(self.delay_for_attempt(calls_made))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(5));
    }

    #[test]
    fn test_next_exhausts_after_max_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.next(1), Backoff::RetryAfter(Duration::from_secs(1)));
        assert_eq!(policy.next(3), Backoff::RetryAfter(Duration::from_secs(4)));
        assert_eq!(policy.next(4), Backoff::Exhausted);
    }

    #[test]
    fn test_from_config() {
        let config = AppConfig {
            retry_base_delay_ms: 250,
            retry_max_attempts: 0,
            ..AppConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_retries(), 0);
    }
}
