//! Per-item exponential backoff.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::RateLimiter;
use crate::queue::Key;

/// Exponential backoff per item: `base_delay * 2^failures`, capped at
/// `max_delay`.
///
/// Every `when` counts as one more failure for the item. Giving up after a
/// number of failures, or expiring old counters, is up to the caller.
///
/// Example with base_delay=1ms:
/// - 1st call: 1ms
/// - 2nd call: 2ms
/// - 3rd call: 4ms
/// - ... until the delay reaches max_delay
#[derive(Debug)]
pub struct ExponentialFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, usize>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: Key> ExponentialFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<T, usize>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Backoff after `failures` previous failures.
    ///
    /// Computed in floating point so a huge exponent becomes infinity instead
    /// of wrapping; anything past `max_delay` (or past what a Duration can
    /// hold) comes back as `max_delay`.
    pub fn backoff(&self, failures: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = i32::try_from(failures).unwrap_or(i32::MAX);
        let backoff = self.base_delay.as_nanos() as f64 * 2f64.powi(exp);
        if !backoff.is_finite() || backoff >= i64::MAX as f64 {
            return self.max_delay;
        }

        let delay = Duration::from_nanos(backoff as u64);
        delay.min(self.max_delay)
    }
}

impl<T: Key> RateLimiter<T> for ExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        drop(failures);

        self.backoff(previous)
    }

    fn forget(&self, item: &T) {
        self.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.lock().get(item).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn doubles_per_failure_and_forget_resets() {
        let limiter = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));

        assert_eq!(limiter.when(&"one"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(2));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(4));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(8));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(16));
        assert_eq!(limiter.num_requeues(&"one"), 5);

        assert_eq!(limiter.when(&"two"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"two"), Duration::from_millis(2));
        assert_eq!(limiter.num_requeues(&"two"), 2);

        limiter.forget(&"one");
        assert_eq!(limiter.num_requeues(&"one"), 0);
        assert_eq!(limiter.when(&"one"), Duration::from_millis(1));
        // other items are untouched
        assert_eq!(limiter.num_requeues(&"two"), 2);
    }

    #[test]
    fn clamps_to_max_delay() {
        let limiter = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(5));
        let delays: Vec<_> = (0..5).map(|_| limiter.when(&0u8)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(5),
                Duration::from_millis(5),
            ]
        );
    }

    #[rstest]
    #[case::millis(Duration::from_millis(1), Duration::from_secs(1000), 5, Duration::from_millis(32))]
    #[case::minutes(Duration::from_secs(60), Duration::from_secs(1000 * 3600), 2, Duration::from_secs(240))]
    fn small_failure_counts_are_exact(
        #[case] base: Duration,
        #[case] max: Duration,
        #[case] failures: usize,
        #[case] expected: Duration,
    ) {
        let limiter = ExponentialFailureRateLimiter::new(base, max);
        for _ in 0..failures {
            limiter.when(&"one");
        }
        assert_eq!(limiter.when(&"one"), expected);
    }

    #[rstest]
    #[case::millis(Duration::from_millis(1), Duration::from_secs(1000))]
    #[case::minutes(Duration::from_secs(60), Duration::from_secs(1000 * 3600))]
    fn overflow_saturates_to_max(#[case] base: Duration, #[case] max: Duration) {
        let limiter = ExponentialFailureRateLimiter::new(base, max);
        for _ in 0..1000 {
            limiter.when(&"overflow");
        }
        assert_eq!(limiter.when(&"overflow"), max);
    }

    #[test]
    fn huge_counts_do_not_wrap() {
        let limiter = ExponentialFailureRateLimiter::<u8>::new(Duration::from_nanos(1), Duration::MAX);
        // 2^62 ns still fits, 2^63 ns does not
        assert_eq!(limiter.backoff(62), Duration::from_nanos(1 << 62));
        assert_eq!(limiter.backoff(63), Duration::MAX);
        assert_eq!(limiter.backoff(usize::MAX), Duration::MAX);
    }

    #[test]
    fn zero_base_never_waits() {
        let limiter = ExponentialFailureRateLimiter::new(Duration::ZERO, Duration::from_secs(1));
        for _ in 0..10 {
            assert_eq!(limiter.when(&"k"), Duration::ZERO);
        }
        assert_eq!(limiter.num_requeues(&"k"), 10);
    }
}
