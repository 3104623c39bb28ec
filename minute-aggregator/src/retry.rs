use std::time;

use crate::config::Config;

#[derive(Copy, Clone, Debug)]
/// The retry policy the flusher follows when a sink write fails transiently.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Total attempts, including the first one, before giving up until the next tick.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            2,
            time::Duration::from_millis(config.sink_retry_initial_ms),
            Some(time::Duration::from_millis(config.sink_retry_max_ms)),
            config.sink_max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before the retry that follows failed attempt number `attempt` (0-based).
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let multiplier = self.backoff_coefficient.saturating_pow(attempt);
        let candidate_interval = self.initial_interval.saturating_mul(multiplier);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: Some(time::Duration::from_secs(2)),
            max_attempts: 3,
        }
    }
}
