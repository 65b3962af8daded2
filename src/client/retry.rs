//! Reconnect backoff policy.
//!
//! Retries are unbounded; the delay grows geometrically from the initial
//! value and saturates at the cap.

use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First retry delay.
    pub initial: Duration,
    /// Delay cap.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(15),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        let raw = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_saturates() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(30), Duration::from_secs(15));
        assert_eq!(policy.delay(63), Duration::from_secs(15));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(15));
    }
}
