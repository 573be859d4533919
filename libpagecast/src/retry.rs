//! Retry controller: decides whether a failed item is re-armed or given up.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::types::PublishFailure;

/// What to do with a queue item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential backoff bounded by `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_secs),
            multiplier: config.multiplier,
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// Retries become due immediately.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before the next attempt.
    ///
    /// `attempts` counts attempts already made, including the one that just
    /// failed: `base * multiplier^(attempts - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// # Arguments
    ///
    /// * `attempts` - attempts made so far, including the failed one
    /// * `max_attempts` - the item's ceiling
    /// * `failure` - the failure that decides retryability
    pub fn next_action(&self, attempts: u32, max_attempts: u32, failure: &PublishFailure) -> NextAction {
        if !failure.retryable || attempts >= max_attempts {
            NextAction::GiveUp
        } else {
            NextAction::RetryAfter(self.next_delay(attempts))
        }
    }
}
