use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::RateLimiter;
use crate::clock::Clock;

#[derive(Debug)]
struct Bucket {
    /// May go negative: each `when` reserves a token whether or not one is
    /// available right now, and negative tokens are paid back by waiting.
    tokens: f64,
    last: Instant,
}

/// Overall token bucket adapted to the rate limiter interface.
///
/// Every call reserves one token and returns how long until that token
/// exists. The item is ignored, so `num_requeues` is always 0 and `forget`
/// does nothing.
///
/// A `burst` of 0, or a non-positive `qps` once the burst is spent, never
/// grants a token; `when` then returns `Duration::MAX`.
pub struct BucketRateLimiter<T> {
    clock: Arc<dyn Clock>,
    qps: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
    _item: PhantomData<fn(&T)>,
}

impl<T> BucketRateLimiter<T> {
    /// Bucket refilling at `qps` tokens per second, holding at most `burst`.
    /// Starts full.
    pub fn new(clock: Arc<dyn Clock>, qps: f64, burst: u32) -> Self {
        let last = clock.now();
        Self {
            clock,
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last,
            }),
            _item: PhantomData,
        }
    }

    pub fn qps(&self) -> f64 {
        self.qps
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve one token, returning the wait until it can be used.
    pub fn reserve(&self) -> Duration {
        if self.burst == 0 {
            return Duration::MAX;
        }
        if self.qps.is_infinite() && self.qps > 0.0 {
            return Duration::ZERO;
        }

        let now = self.clock.now();
        let mut bucket = self.lock();

        if self.qps.is_nan() || self.qps <= 0.0 {
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Duration::ZERO;
            }
            return Duration::MAX;
        }

        let elapsed = now.saturating_duration_since(bucket.last);
        let refill = elapsed.as_secs_f64() * self.qps;
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.burst));
        if now > bucket.last {
            bucket.last = now;
        }

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter<T> {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn fake() -> Arc<FakeClock> {
        Arc::new(FakeClock::new(Instant::now()))
    }

    #[test]
    fn burst_is_free_then_waits_accumulate() {
        let clock = fake();
        let limiter = BucketRateLimiter::<&str>::new(clock.clone(), 1.0, 2);

        assert_eq!(limiter.when(&"a"), Duration::ZERO);
        assert_eq!(limiter.when(&"b"), Duration::ZERO);
        assert_eq!(limiter.when(&"c"), Duration::from_secs(1));
        assert_eq!(limiter.when(&"d"), Duration::from_secs(2));
    }

    #[test]
    fn tokens_refill_over_time() {
        let clock = fake();
        let limiter = BucketRateLimiter::<&str>::new(clock.clone(), 2.0, 1);

        assert_eq!(limiter.when(&"a"), Duration::ZERO);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(500));

        // pays back the reservation and refills one token
        clock.step(Duration::from_secs(1));
        assert_eq!(limiter.when(&"a"), Duration::ZERO);
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let clock = fake();
        let limiter = BucketRateLimiter::<u32>::new(clock.clone(), 1.0, 3);
        clock.step(Duration::from_secs(60));

        for _ in 0..3 {
            assert_eq!(limiter.when(&0), Duration::ZERO);
        }
        assert_eq!(limiter.when(&0), Duration::from_secs(1));
    }

    #[test]
    fn ignores_the_item() {
        let limiter = BucketRateLimiter::<&str>::new(fake(), 1.0, 1);
        limiter.when(&"one");
        limiter.when(&"one");
        assert_eq!(limiter.num_requeues(&"one"), 0);
        limiter.forget(&"one");
        // forgetting does not give the token back
        assert_eq!(limiter.when(&"one"), Duration::from_secs(2));
    }

    #[test]
    fn degenerate_buckets() {
        let empty = BucketRateLimiter::<u32>::new(fake(), 10.0, 0);
        assert_eq!(empty.when(&1), Duration::MAX);

        let frozen = BucketRateLimiter::<u32>::new(fake(), 0.0, 1);
        assert_eq!(frozen.when(&1), Duration::ZERO);
        assert_eq!(frozen.when(&1), Duration::MAX);

        let unlimited = BucketRateLimiter::<u32>::new(fake(), f64::INFINITY, 1);
        for _ in 0..10 {
            assert_eq!(unlimited.when(&1), Duration::ZERO);
        }
    }
}
