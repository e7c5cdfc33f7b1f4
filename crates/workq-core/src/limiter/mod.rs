//! Rate limiters: decide how long an item waits before it is requeued.
//!
//! - [`BucketRateLimiter`]: one shared token bucket, ignores the item.
//! - [`ExponentialFailureRateLimiter`]: `base * 2^failures`, capped.
//! - [`FastSlowRateLimiter`]: a few quick retries, then slow ones.
//! - [`MaxOfRateLimiter`]: the worst case of several limiters.

mod bucket;
mod exponential;
mod fast_slow;
mod max_of;

pub use bucket::BucketRateLimiter;
pub use exponential::ExponentialFailureRateLimiter;
pub use fast_slow::FastSlowRateLimiter;
pub use max_of::MaxOfRateLimiter;

use std::sync::Arc;
use std::time::Duration;

use crate::clock::RealClock;
use crate::queue::Key;

pub trait RateLimiter<T>: Send + Sync {
    /// How long `item` should wait. Counts as one more requeue of `item`.
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item`, whether it finally succeeded or failed for good.
    fn forget(&self, item: &T);

    /// How many failures `item` has had.
    fn num_requeues(&self, item: &T) -> usize;
}

impl<T, L: RateLimiter<T> + ?Sized> RateLimiter<T> for Box<L> {
    fn when(&self, item: &T) -> Duration {
        (**self).when(item)
    }

    fn forget(&self, item: &T) {
        (**self).forget(item)
    }

    fn num_requeues(&self, item: &T) -> usize {
        (**self).num_requeues(item)
    }
}

impl<T, L: RateLimiter<T> + ?Sized> RateLimiter<T> for Arc<L> {
    fn when(&self, item: &T) -> Duration {
        (**self).when(item)
    }

    fn forget(&self, item: &T) {
        (**self).forget(item)
    }

    fn num_requeues(&self, item: &T) -> usize {
        (**self).num_requeues(item)
    }
}

/// Default limiter for controllers: per-item exponential backoff
/// (5ms .. 1000s) combined with an overall 10 qps / 100 burst token bucket.
/// The bucket only limits retry speed overall, not per item.
pub fn default_controller_rate_limiter<T: Key>() -> MaxOfRateLimiter<T> {
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(Arc::new(RealClock), 10.0, 100)),
    ])
}

/// Per-item exponential backoff from 1ms up to 1000s.
pub fn default_based_rate_limiter<T: Key>() -> ExponentialFailureRateLimiter<T> {
    ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1000))
}
