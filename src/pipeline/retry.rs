use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::ProcessingError;

/// Exponential backoff for store and transport operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Delay before the next attempt, or `None` when `err` should be surfaced.
    ///
    /// `failed_attempts` counts attempts already made, including the one that
    /// produced `err`.
    pub fn next_delay(&self, err: &ProcessingError, failed_attempts: u32) -> Option<Duration> {
        if !err.is_retryable() || failed_attempts >= self.max_attempts {
            return None;
        }

        let exponent = failed_attempts.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        Some(delay.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}
