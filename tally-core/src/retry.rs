//! Exponential backoff shared by the whole delivery queue
//!
//! There is only ever one request in flight, so one counter is enough: it
//! doubles on every consecutive failure, is capped, and snaps back to the
//! initial value on the first success.

use std::time::Duration;

use crate::config::CollectorConfig;

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl RetryScheduler {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(config.initial_delay(), config.max_delay())
    }

    /// Record a failure and return the delay to wait before the retry.
    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    /// Record a success; the next failure starts from the initial delay again.
    pub fn on_success(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::from_config(&CollectorConfig::default())
    }
}
