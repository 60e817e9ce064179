//! Retry Logic
//!
//! Exponential backoff used by connect attempts, reconnect cycles and the
//! single operation retry after a reconnect.

use std::time::Duration;

use super::classify::ErrorClass;
use crate::config::ConnectionConfig;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Policy derived from a connection's advanced options
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.max_retries()).with_backoff(config.retry_base_delay(), config.retry_max_delay())
    }

    /// Delay before attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a failure of `class` on attempt `attempt` (1-based) may be retried.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        if attempt > self.max_retries {
            return false;
        }
        match class {
            ErrorClass::ConnectionLost
            | ErrorClass::Timeout
            | ErrorClass::Unreachable
            | ErrorClass::Refused => true,
            ErrorClass::AuthFailure | ErrorClass::NotFound | ErrorClass::Unknown => false,
        }
    }
}
