//! Deduplicating FIFO work queue.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Key, WorkQueue};

/// Snapshot of the queue for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub dirty: usize,
    pub shutting_down: bool,
}

/// Queue state guarded by the mutex.
///
/// ```text
///  queue      [1, 2, 3]         queue      [2, 3]         queue      [2, 3]
///  dirty      {1, 2, 3}   -->   dirty      {2, 3}   -->   dirty      {2, 3}
///  processing {}          get   processing {1}      done  processing {}
/// ```
struct State<T> {
    /// Order in which items are handed out. Every element is in `dirty`
    /// and not in `processing`.
    queue: VecDeque<T>,

    /// Everything that needs processing.
    dirty: HashSet<T>,

    /// Items handed out by `get` and not yet `done`. An item may be in
    /// `dirty` at the same time; `done` then puts it back in `queue`.
    processing: HashSet<T>,

    shutting_down: bool,

    /// Set by `shut_down_with_drain`, cleared by `shut_down`.
    drain: bool,
}

/// Deduplicating work queue.
///
/// # 実装詳細
/// - one `Mutex<State>` for the queue, the dirty set and the processing set
/// - `cond` wakes one consumer per new item, every consumer on shutdown
/// - `drained` wakes `shut_down_with_drain` once nothing is processing
pub struct BaseQueue<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    drained: Condvar,
}

impl<T: Key> BaseQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
                drain: false,
            }),
            cond: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    // The state is consistent between statements, so a panic in another
    // holder does not make it unusable.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            queued: state.queue.len(),
            processing: state.processing.len(),
            dirty: state.dirty.len(),
            shutting_down: state.shutting_down,
        }
    }
}

impl<T: Key> Default for BaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Key> WorkQueue<T> for BaseQueue<T> {
    fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down {
            debug!(?item, "queue is shutting down, ignoring add");
            return;
        }
        if state.dirty.contains(&item) {
            return;
        }

        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(?item, "item is being processed, marked dirty");
            return;
        }

        state.queue.push_back(item);
        self.cond.notify_one();
    }

    fn len(&self) -> usize {
        self.lock().queue.len()
    }

    fn get(&self) -> Option<T> {
        let mut state = self.lock();
        while state.queue.is_empty() && !state.shutting_down {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        // empty here means we are shutting down
        let item = state.queue.pop_front()?;
        state.dirty.remove(&item);
        state.processing.insert(item.clone());
        Some(item)
    }

    fn done(&self, item: &T) {
        let mut state = self.lock();
        if !state.processing.remove(item) {
            // never handed out by `get` (or already done): nothing to release
            debug!(?item, "done called for an item that is not being processed");
            return;
        }

        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.cond.notify_one();
        }
        if state.processing.is_empty() {
            self.drained.notify_all();
        }
    }

    fn shut_down(&self) {
        let mut state = self.lock();
        state.drain = false;
        state.shutting_down = true;
        self.cond.notify_all();
        self.drained.notify_all();
    }

    fn shut_down_with_drain(&self) {
        let mut state = self.lock();
        state.drain = true;
        state.shutting_down = true;
        self.cond.notify_all();

        while state.drain && !state.processing.is_empty() {
            state = self.drained.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
