//! Queue module: the deduplicating base queue, the delaying layer and the
//! rate limiting layer on top of it.
//!
//! Layering:
//! - [`BaseQueue`]: dedup FIFO, `get` blocks until work or shutdown.
//! - [`DelayingQueue`]: adds `add_after`, backed by a scheduler thread.
//! - [`RateLimitingQueue`]: adds `add_rate_limited`, delay comes from a limiter.

mod base;
mod delaying;
mod rate_limiting;
mod wait_queue;

pub use base::{BaseQueue, QueueStats};
pub use delaying::DelayingQueue;
pub use rate_limiting::RateLimitingQueue;

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

/// Anything usable as a work item key.
///
/// Identity is by equality: two equal keys are the same unit of work.
pub trait Key: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// Work queue port (interface).
///
/// Design intent:
/// - A key is handed to at most one consumer at a time.
/// - Adding a key that is already waiting is a no-op.
/// - Adding a key that is being processed marks it dirty; `done` puts it back.
pub trait WorkQueue<T: Key>: Send + Sync {
    /// Mark `item` as needing processing.
    fn add(&self, item: T);

    /// Number of items waiting for `get`. Informational only: never gate
    /// `add`/`get` on it, it can change right after it is read.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until an item is available. `None` means the queue is shut down
    /// and empty; the caller should stop its loop.
    /// Every returned item must be passed to `done` afterwards.
    fn get(&self) -> Option<T>;

    /// Mark `item` as finished. If it was added again while being processed
    /// it goes back to the queue.
    fn done(&self, item: &T);

    /// Ignore further adds and wake every blocked `get`.
    fn shut_down(&self);

    /// Like `shut_down`, then block until every item handed out by `get`
    /// has been passed to `done`. Calling `shut_down` afterwards stops the wait.
    fn shut_down_with_drain(&self);

    fn shutting_down(&self) -> bool;
}

/// A work queue that can add an item later. Makes it easy to requeue items
/// after failures without ending up in a hot loop.
pub trait DelayingWorkQueue<T: Key>: WorkQueue<T> {
    /// Add `item` once `delay` has passed. A zero delay adds it right away.
    fn add_after(&self, item: T, delay: Duration);
}

/// A work queue that asks a rate limiter how long to wait before requeueing.
pub trait RateLimitingWorkQueue<T: Key>: DelayingWorkQueue<T> {
    /// Add `item` after the delay the rate limiter picks for it.
    fn add_rate_limited(&self, item: T);

    /// Stop tracking `item` in the rate limiter, whether it finally succeeded
    /// or failed for good. This does not touch queue membership: `done` still
    /// has to be called.
    fn forget(&self, item: &T);

    /// How many times `item` has been requeued through the rate limiter.
    fn num_requeues(&self, item: &T) -> usize;
}
