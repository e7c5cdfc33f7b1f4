use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::{DelayingQueue, DelayingWorkQueue, Key, QueueStats, RateLimitingWorkQueue, WorkQueue};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::WorkqError;
use crate::limiter::{RateLimiter, default_controller_rate_limiter};

/// Delaying queue whose requeue delays come from a [`RateLimiter`].
pub struct RateLimitingQueue<T: Key> {
    queue: DelayingQueue<T>,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T: Key> RateLimitingQueue<T> {
    /// Real-clock delaying queue with the given limiter.
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self::with_delaying_queue(DelayingQueue::new(), limiter)
    }

    pub fn with_delaying_queue(queue: DelayingQueue<T>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            queue,
            limiter: Box::new(limiter),
        }
    }

    /// Validate `config`, then build the queue and its limiter on `clock`.
    pub fn from_config(clock: Arc<dyn Clock>, config: &QueueConfig) -> Result<Self, WorkqError> {
        let queue = DelayingQueue::with_config(Arc::clone(&clock), config)?;
        let limiter = config.limiter.build::<T>(clock);
        Ok(Self { queue, limiter })
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn waiting_len(&self) -> usize {
        self.queue.waiting_len()
    }
}

impl<T: Key> Default for RateLimitingQueue<T> {
    /// Real clock with the default controller limiter.
    fn default() -> Self {
        Self::new(default_controller_rate_limiter())
    }
}

impl<T: Key> WorkQueue<T> for RateLimitingQueue<T> {
    fn add(&self, item: T) {
        self.queue.add(item);
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn get(&self) -> Option<T> {
        self.queue.get()
    }

    fn done(&self, item: &T) {
        self.queue.done(item);
    }

    fn shut_down(&self) {
        self.queue.shut_down();
    }

    fn shut_down_with_drain(&self) {
        self.queue.shut_down_with_drain();
    }

    fn shutting_down(&self) -> bool {
        self.queue.shutting_down()
    }
}

impl<T: Key> DelayingWorkQueue<T> for RateLimitingQueue<T> {
    fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
    }
}

impl<T: Key> RateLimitingWorkQueue<T> for RateLimitingQueue<T> {
    fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        trace!(?item, ?delay, "rate limited requeue");
        self.queue.add_after(item, delay);
    }

    fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.limiter.num_requeues(item)
    }
}
