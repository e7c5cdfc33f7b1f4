use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::RateLimiter;
use crate::queue::Key;

/// Quick retries for the first `max_fast_attempts` attempts of an item,
/// slow retries after that.
#[derive(Debug)]
pub struct FastSlowRateLimiter<T> {
    failures: Mutex<HashMap<T, usize>>,
    max_fast_attempts: usize,
    fast_delay: Duration,
    slow_delay: Duration,
}

impl<T: Key> FastSlowRateLimiter<T> {
    pub fn new(fast_delay: Duration, slow_delay: Duration, max_fast_attempts: usize) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            max_fast_attempts,
            fast_delay,
            slow_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<T, usize>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Key> RateLimiter<T> for FastSlowRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.lock();
        let count = failures.entry(item.clone()).or_insert(0);
        *count = count.saturating_add(1);

        if *count <= self.max_fast_attempts {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }

    fn forget(&self, item: &T) {
        self.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.lock().get(item).copied().unwrap_or(0)
    }
}
