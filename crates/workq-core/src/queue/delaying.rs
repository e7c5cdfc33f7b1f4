//! Delaying queue: a [`BaseQueue`] plus a scheduler thread that adds items
//! once their delay has passed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, trace, warn};

use super::wait_queue::{WaitFor, WaitQueue};
use super::{BaseQueue, DelayingWorkQueue, Key, QueueStats, WorkQueue};
use crate::clock::{Clock, RealClock, Ticker};
use crate::config::QueueConfig;
use crate::error::WorkqError;

/// Upper bound on how long the scheduler sleeps between checks.
pub const MAX_WAIT: Duration = Duration::from_secs(10);

/// Capacity of the hand-off channel between producers and the scheduler.
pub const WAITING_CHANNEL_CAPACITY: usize = 1000;

// Fallback when `now + delay` does not fit in an Instant.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Work queue with delayed adds.
///
/// # 実装詳細
/// - `add_after` sends `{item, ready_at}` over a bounded channel, so producers
///   never touch the scheduler's heap.
/// - One scheduler thread per queue owns the heap; it is the only writer.
/// - Two requests for the same item are merged to the earlier `ready_at`.
pub struct DelayingQueue<T: Key> {
    queue: Arc<BaseQueue<T>>,
    clock: Arc<dyn Clock>,

    waiting_tx: Sender<WaitFor<T>>,

    // Dropping the sender closes the stop channel; taking it out of the
    // Option makes the stop happen once.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,

    waiting: Arc<AtomicUsize>,
    scheduler: Option<JoinHandle<()>>,
}

impl<T: Key> DelayingQueue<T> {
    /// Delaying queue on the real clock.
    ///
    /// # Panics
    /// If the scheduler thread cannot be spawned, like `std::thread::spawn`.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock))
    }

    /// # Panics
    /// If the scheduler thread cannot be spawned.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::build(clock, MAX_WAIT, WAITING_CHANNEL_CAPACITY)
    }

    /// Validate `config` and build from it. The limiter part is only
    /// validated, not used.
    ///
    /// # Panics
    /// If the scheduler thread cannot be spawned.
    pub fn with_config(clock: Arc<dyn Clock>, config: &QueueConfig) -> Result<Self, WorkqError> {
        config.validate()?;
        Ok(Self::build(clock, config.heartbeat(), config.channel_capacity))
    }

    fn build(clock: Arc<dyn Clock>, heartbeat: Duration, capacity: usize) -> Self {
        let queue = Arc::new(BaseQueue::new());
        let (waiting_tx, waiting_rx) = crossbeam_channel::bounded(capacity.max(1));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let waiting = Arc::new(AtomicUsize::new(0));

        let scheduler = Scheduler {
            queue: Arc::clone(&queue),
            clock: Arc::clone(&clock),
            heartbeat: clock.new_ticker(heartbeat),
            waiting_rx,
            stop_rx: stop_rx.clone(),
            pending: WaitQueue::new(),
            waiting: Arc::clone(&waiting),
        };
        let handle = thread::Builder::new()
            .name("workq-scheduler".to_string())
            .spawn(move || scheduler.run())
            .expect("failed to spawn delaying queue scheduler thread");

        Self {
            queue,
            clock,
            waiting_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            waiting,
            scheduler: Some(handle),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Number of items parked in the scheduler, waiting for their delay.
    pub fn waiting_len(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    fn stop_scheduler(&self) {
        let stop = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if stop.is_some() {
            debug!("stopping delaying queue scheduler");
        }
    }
}

impl<T: Key> Default for DelayingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Key> WorkQueue<T> for DelayingQueue<T> {
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
        self.stop_scheduler();
    }

    fn shut_down_with_drain(&self) {
        self.stop_scheduler();
        self.queue.shut_down_with_drain();
    }

    fn shutting_down(&self) -> bool {
        self.queue.shutting_down()
    }
}

impl<T: Key> DelayingWorkQueue<T> for DelayingQueue<T> {
    fn add_after(&self, item: T, delay: Duration) {
        if self.shutting_down() {
            return;
        }

        if delay.is_zero() {
            self.add(item);
            return;
        }

        let now = self.clock.now();
        let Some(ready_at) = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
        else {
            warn!(?item, ?delay, "delay out of range, dropping item");
            return;
        };

        let entry = WaitFor {
            data: item,
            ready_at,
        };
        select! {
            // unblocks if shut down while the channel is full
            recv(self.stop_rx) -> _ => {}
            send(self.waiting_tx, entry) -> _ => {}
        }
    }
}

impl<T: Key> Drop for DelayingQueue<T> {
    fn drop(&mut self) {
        self.shut_down();
        if let Some(handle) = self.scheduler.take()
            && handle.join().is_err()
        {
            error!("delaying queue scheduler exited with a panic");
        }
    }
}

/// Scheduler loop state. Lives on its own thread and owns the heap.
struct Scheduler<T: Key> {
    queue: Arc<BaseQueue<T>>,
    clock: Arc<dyn Clock>,

    /// Wakes the loop at least every `MAX_WAIT`, even with nothing scheduled.
    heartbeat: Ticker,

    waiting_rx: Receiver<WaitFor<T>>,
    stop_rx: Receiver<()>,

    pending: WaitQueue<T>,
    waiting: Arc<AtomicUsize>,
}

impl<T: Key> Scheduler<T> {
    fn run(mut self) {
        debug!("delaying queue scheduler started");
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.waiting_loop()));
        if let Err(cause) = result {
            let message = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%message, "observed a panic in the delaying queue scheduler");
            panic::resume_unwind(cause);
        }
        debug!("delaying queue scheduler stopped");
    }

    fn waiting_loop(&mut self) {
        let never = crossbeam_channel::never::<Instant>();
        let mut arrived = Vec::new();

        loop {
            if self.queue.shutting_down() {
                return;
            }

            // Add ready entries
            let now = self.clock.now();
            while let Some(entry) = self.pending.pop_ready(now) {
                trace!(item = ?entry.data, "delay elapsed, adding item");
                self.queue.add(entry.data);
            }

            // Wait for the first item's ready_at, if there is one. The timer
            // from the previous iteration has been dropped (stopped) by now.
            let next_ready_at = self
                .pending
                .peek()
                .map(|entry| self.clock.new_timer_at(entry.ready_at));
            let ready = next_ready_at.as_ref().map_or(&never, |t| t.channel());
            self.publish_len();

            select! {
                recv(self.stop_rx) -> _ => return,
                recv(self.heartbeat.channel()) -> _ => {}
                recv(ready) -> _ => {}
                recv(self.waiting_rx) -> msg => {
                    let Ok(entry) = msg else {
                        return;
                    };
                    arrived.push(entry);
                    // take everything buffered before setting a new timer
                    arrived.extend(self.waiting_rx.try_iter());
                }
            }

            for entry in arrived.drain(..) {
                self.accept(entry);
            }
        }
    }

    fn accept(&mut self, entry: WaitFor<T>) {
        if entry.ready_at > self.clock.now() {
            self.pending.insert(entry);
        } else {
            self.queue.add(entry.data);
        }
    }

    fn publish_len(&self) {
        self.waiting.store(self.pending.len(), Ordering::Release);
    }
}
