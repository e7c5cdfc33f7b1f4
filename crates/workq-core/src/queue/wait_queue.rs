//! Min-heap of delayed entries, keyed by item.
//!
//! `BinaryHeap` cannot move an element once it is inside, so this keeps its
//! own array heap plus an `item -> slot` index that every swap updates. That
//! gives O(log n) "fire earlier" updates for items that are already waiting.

use std::collections::HashMap;
use std::time::Instant;

use super::Key;

/// An item and the time it should be added to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WaitFor<T> {
    pub(crate) data: T,
    pub(crate) ready_at: Instant,
}

pub(crate) struct WaitQueue<T> {
    heap: Vec<WaitFor<T>>,
    slots: HashMap<T, usize>,
}

impl<T: Key> WaitQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: Vec::new(),
            slots: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn peek(&self) -> Option<&WaitFor<T>> {
        self.heap.first()
    }

    #[cfg(test)]
    pub(crate) fn ready_at(&self, item: &T) -> Option<Instant> {
        self.slots.get(item).map(|&i| self.heap[i].ready_at)
    }

    /// Add the entry, or move an existing entry for the same item earlier.
    /// An existing entry is never pushed back.
    pub(crate) fn insert(&mut self, entry: WaitFor<T>) {
        if let Some(&slot) = self.slots.get(&entry.data) {
            if entry.ready_at < self.heap[slot].ready_at {
                self.heap[slot].ready_at = entry.ready_at;
                self.sift_up(slot);
            }
            return;
        }

        let slot = self.heap.len();
        self.slots.insert(entry.data.clone(), slot);
        self.heap.push(entry);
        self.sift_up(slot);
    }

    /// Remove and return the earliest entry if it is due at `now`.
    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<WaitFor<T>> {
        if self.peek()?.ready_at > now {
            return None;
        }

        let last = self.heap.len() - 1;
        self.swap(0, last);
        let entry = self.heap.pop()?;
        self.slots.remove(&entry.data);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(entry)
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.heap.swap(i, j);
        if let Some(slot) = self.slots.get_mut(&self.heap[i].data) {
            *slot = i;
        }
        if let Some(slot) = self.slots.get_mut(&self.heap[j].data) {
            *slot = j;
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].ready_at <= self.heap[i].ready_at {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let child = if right < n && self.heap[right].ready_at < self.heap[left].ready_at {
                right
            } else {
                left
            };
            if self.heap[i].ready_at <= self.heap[child].ready_at {
                break;
            }
            self.swap(i, child);
            i = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn entry(data: &'static str, base: Instant, ms: u64) -> WaitFor<&'static str> {
        WaitFor {
            data,
            ready_at: base + Duration::from_millis(ms),
        }
    }

    fn check_index(q: &WaitQueue<&'static str>) {
        assert_eq!(q.slots.len(), q.heap.len());
        for (i, e) in q.heap.iter().enumerate() {
            assert_eq!(q.slots[&e.data], i, "index out of sync for {}", e.data);
        }
    }

    #[test]
    fn pops_in_ready_order() {
        let base = Instant::now();
        let mut q = WaitQueue::new();
        for (name, ms) in [("e", 50), ("a", 10), ("d", 40), ("b", 20), ("c", 30)] {
            q.insert(entry(name, base, ms));
            check_index(&q);
        }

        let far = base + Duration::from_secs(1);
        let order: Vec<_> = std::iter::from_fn(|| q.pop_ready(far).map(|e| e.data)).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn pop_ready_respects_now() {
        let base = Instant::now();
        let mut q = WaitQueue::new();
        q.insert(entry("later", base, 100));
        q.insert(entry("soon", base, 10));

        assert!(q.pop_ready(base).is_none());
        assert_eq!(q.pop_ready(base + Duration::from_millis(10)).unwrap().data, "soon");
        assert!(q.pop_ready(base + Duration::from_millis(99)).is_none());
        assert_eq!(q.len(), 1);
        check_index(&q);
    }

    #[test]
    fn duplicate_keeps_the_earliest_time() {
        let base = Instant::now();
        let mut q = WaitQueue::new();
        q.insert(entry("k", base, 5_000));
        q.insert(entry("other", base, 2_000));

        q.insert(entry("k", base, 1_000));
        assert_eq!(q.len(), 2);
        assert_eq!(q.ready_at(&"k"), Some(base + Duration::from_millis(1_000)));
        assert_eq!(q.peek().unwrap().data, "k");
        check_index(&q);

        // a later request never postpones
        q.insert(entry("k", base, 9_000));
        assert_eq!(q.ready_at(&"k"), Some(base + Duration::from_millis(1_000)));
        check_index(&q);
    }

    #[test]
    fn index_survives_mixed_operations() {
        let base = Instant::now();
        let mut q = WaitQueue::new();
        let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
        for (i, &name) in names.iter().enumerate() {
            q.insert(entry(name, base, 100 * (names.len() - i) as u64));
        }
        check_index(&q);

        q.insert(entry("h", base, 1));
        q.insert(entry("a", base, 2));
        check_index(&q);

        assert_eq!(q.pop_ready(base + Duration::from_millis(1)).unwrap().data, "h");
        check_index(&q);
        assert_eq!(q.pop_ready(base + Duration::from_millis(2)).unwrap().data, "a");
        check_index(&q);
        assert_eq!(q.len(), names.len() - 2);
    }
}
