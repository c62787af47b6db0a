//! Retry backoff for transient store errors.

use std::time::Duration;

/// Exponential backoff: `initial * factor^(n-1)`, capped at `max`.
///
/// No jitter: the retry cadence is part of the protocol contract and is
/// asserted by tests.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Attempts before the error is surfaced as retries-exhausted.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(20),
            max_retries: 8,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let backoff = BackoffConfig::default();
        // 500ms, 1s, 2s, 4s, 8s, 16s, then capped at 20s.
        let expected_ms = [500, 1000, 2000, 4000, 8000, 16000, 20000, 20000];
        for (i, &ms) in expected_ms.iter().enumerate() {
            let delay = backoff.delay_for_attempt((i + 1) as u32);
            assert_eq!(delay, Duration::from_millis(ms), "attempt {}", i + 1);
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(20));
    }
}
