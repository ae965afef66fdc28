//! Bounded exponential backoff for transient remote failures

use std::time::Duration;

use crate::config::ApiConfig;

/// Retry schedule for a single remote operation.
///
/// `max_attempts` counts the first try, so `3` means one call plus two retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn from_api_config(config: &ApiConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            factor: 2.0,
        }
    }

    /// Near-zero delays for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
