//! Reconnect delays: jittered exponential back-off.

use std::time::Duration;

/// Fraction of the un-jittered delay that may be added as jitter.
const JITTER_FRACTION: f64 = 0.10;

/// `base * 2^attempt`, plus up to 10% uniform jitter, clamped to `max`.
///
/// `attempt` is the zero-based count of prior consecutive failures.
pub fn delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as f64;
    let max_ms = max.as_millis() as f64;
    // powi saturates to infinity for huge attempts; min() brings it back.
    let raw_ms = base_ms * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
    let jitter_ms = raw_ms * JITTER_FRACTION * rand::random::<f64>();
    let delay_ms = (raw_ms + jitter_ms).min(max_ms);
    Duration::from_millis(delay_ms as u64)
}

/// Reconnect policy derived from the session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Consecutive failures before giving up.  `0` means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        delay(attempt, self.base_delay, self.max_delay)
    }

    /// Whether `attempts` consecutive failures exhaust the policy.
    pub fn should_give_up(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}
