//! Retry backoff with exponential growth, a cap, and symmetric jitter.

use std::time::Duration;

use rand::Rng;

/// Jitter applied around each computed delay (±15%).
const JITTER_FRACTION: f64 = 0.15;

/// Backoff policy for a retryable stage.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry attempts after the first try (0 = never retry).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        jittered(exponential(self.base_delay, self.max_delay, attempt))
    }
}

/// `base * 2^attempt`, saturating at `cap`.
pub fn exponential(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(cap)
}

/// Apply symmetric jitter of ±[`JITTER_FRACTION`] to a delay.
pub fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_and_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(15);

        assert_eq!(exponential(base, cap, 0), Duration::from_millis(500));
        assert_eq!(exponential(base, cap, 1), Duration::from_secs(1));
        assert_eq!(exponential(base, cap, 2), Duration::from_secs(2));
        assert_eq!(exponential(base, cap, 10), cap);
        // Huge attempts must not overflow.
        assert_eq!(exponential(base, cap, u32::MAX), cap);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_secs(4);
        for _ in 0..200 {
            let j = jittered(delay);
            assert!(j >= delay.mul_f64(1.0 - JITTER_FRACTION));
            assert!(j <= delay.mul_f64(1.0 + JITTER_FRACTION));
        }
    }

    #[test]
    fn jitter_of_zero_is_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn policy_delays_strictly_increase_before_cap() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(60));
        // Compare un-jittered midpoints: jitter is ±15%, growth is 2x, so
        // consecutive jittered delays still increase.
        for attempt in 0..4 {
            let a = policy.delay_for(attempt);
            let b = policy.delay_for(attempt + 1);
            assert!(b > a, "attempt {attempt}: {a:?} !< {b:?}");
        }
    }

    #[test]
    fn none_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }
}
