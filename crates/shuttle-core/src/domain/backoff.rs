//! Backoff policy: decides reconnect delays.

use std::time::Duration;

/// Capped exponential backoff.
///
/// delay = base_delay * multiplier^(attempt - 1), never above `max_delay`.
///
/// Example with base_delay=100ms, multiplier=2.0, max_delay=1s:
/// - attempt 1: 100ms
/// - attempt 2: 200ms
/// - attempt 3: 400ms
/// - attempt 4: 800ms
/// - attempt 5+: 1s
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// # Arguments
    /// * `attempt` - Number of consecutive failures so far (1-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}
