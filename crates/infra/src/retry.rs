//! Exponential backoff shared by job retries and hook redelivery.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed in total (0 = never retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction (0.0-1.0) of the delay used as jitter.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Hook redelivery: attempt `n` waits `min(2^(n-1) * base, 600s)`, 10 attempts.
    pub fn hook_delivery(base_delay: Duration) -> Self {
        Self {
            max_attempts: 10,
            base_delay,
            max_delay: Duration::from_secs(600),
            jitter: 0.0,
        }
    }

    /// Job handler retries, capped at one hour.
    pub fn job_retry(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }

    /// Delay before attempt `attempt` (1-indexed): `base * 2^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        // Saturate the exponent; 2^63 ms is far beyond any cap.
        let exp = 2_f64.powi((attempt - 1).min(63) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_backoff_doubles_then_caps_at_ten_minutes() {
        let policy = RetryPolicy::hook_delivery(Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(512));
        assert_eq!(policy.delay_for_attempt(11), Duration::from_secs(600));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(600));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        let policy = RetryPolicy::job_retry(3, Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_cap() {
        let policy = RetryPolicy::job_retry(5, Duration::from_secs(10));
        for attempt in 1..20 {
            assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(3600));
        }
    }

    #[test]
    fn zero_fail_budget_never_retries() {
        let policy = RetryPolicy::job_retry(0, Duration::from_secs(1));
        assert!(!policy.should_retry(0));
    }
}
