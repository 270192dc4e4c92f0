//! Exponential backoff with optional jitter.
//!
//! The delay before retry `n` (0-indexed, counted from the first failure) is
//! `min(initial_delay * backoff_factor^n, max_delay)`. With jitter enabled a
//! signed offset of up to 25% of that delay is added, and the result is
//! clamped back into `0..=max_delay`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Fraction of the computed delay used as the jitter spread.
const JITTER_RATIO: f64 = 0.25;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `max_retries + 1` attempts in total.
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,

    /// Upper bound for any computed delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    /// Multiplier applied per attempt. Values below 1.0 are treated as 1.0.
    pub backoff_factor: f64,

    /// Whether to randomize delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, never retried.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sets the number of retries after the first attempt.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub const fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total number of attempts the executor makes.
    #[must_use]
    pub const fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt`, before jitter.
    ///
    /// Never exceeds `max_delay` and never decreases as `attempt` grows.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let factor = self.backoff_factor.max(1.0);
        let delay = self.initial_delay.as_secs_f64() * factor.powf(f64::from(attempt));
        if delay >= max {
            return self.max_delay;
        }
        secs_to_duration(delay)
    }

    /// Delay after failed attempt `attempt`, with jitter applied if enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let spread = base_secs * JITTER_RATIO;
        if spread <= 0.0 {
            return base;
        }

        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = base_secs + offset;
        if jittered >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        secs_to_duration(jittered.max(0.0))
    }
}

/// Converts finite, non-negative seconds to a `Duration`, rounding to the
/// nearest nanosecond.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn secs_to_duration(secs: f64) -> Duration {
    Duration::from_nanos((secs * 1e9).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> RetryConfig {
        RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_backoff_factor(2.0)
            .with_jitter(false)
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.total_attempts(), 4);
        assert!(config.jitter);
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(RetryConfig::no_retry().total_attempts(), 1);
    }

    #[test]
    fn test_delay_calculation() {
        let config = fixed();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let config = fixed();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(60), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_is_monotonic_without_jitter() {
        let config = fixed();
        for attempt in 0..40 {
            assert!(config.delay_for_attempt(attempt + 1) >= config.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn test_shrinking_factor_does_not_shrink_delay() {
        let config = fixed().with_backoff_factor(0.5);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = fixed().with_jitter(true);
        for attempt in 0..12 {
            let base = config.base_delay(attempt);
            for _ in 0..50 {
                let delay = config.delay_for_attempt(attempt);
                assert!(delay <= config.max_delay);
                assert!(delay.as_secs_f64() >= base.as_secs_f64() * 0.75 - 1e-9);
                assert!(delay.as_secs_f64() <= base.as_secs_f64() * 1.25 + 1e-9);
            }
        }
    }

    #[test]
    fn test_jitter_varies_delays() {
        let config = fixed().with_jitter(true);
        let first = config.delay_for_attempt(2);
        let varied = (0..32).any(|_| config.delay_for_attempt(2) != first);
        assert!(varied);
    }
}
