//! Clock - 時刻の抽象化
//!
//! The delaying queue and the token bucket never read the system time
//! directly; they go through [`Clock`] so tests can move time by hand.
//!
//! - **RealClock**: backed by `Instant::now()` and crossbeam timers (production).
//! - **FakeClock**: time only moves on `step` / `set_time` (tests).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

/// Clock は現在時刻とタイマーを提供
///
/// Timers and tickers deliver on a crossbeam channel so the scheduler can
/// `select!` over them together with its other inputs.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// One-shot timer that fires once `d` has elapsed.
    fn new_timer(&self, d: Duration) -> Timer;

    /// One-shot timer that fires at `deadline`.
    fn new_timer_at(&self, deadline: Instant) -> Timer {
        self.new_timer(deadline.saturating_duration_since(self.now()))
    }

    /// Repeating ticker with period `d`. Ticks are dropped if nobody reads them.
    fn new_ticker(&self, d: Duration) -> Ticker;

    fn since(&self, t: Instant) -> Duration {
        self.now().saturating_duration_since(t)
    }
}

/// A one-shot timer. Dropping it stops it.
pub struct Timer {
    rx: Receiver<Instant>,
    _alive: Option<Arc<()>>,
}

impl Timer {
    pub fn channel(&self) -> &Receiver<Instant> {
        &self.rx
    }

    /// Same as dropping the timer.
    pub fn stop(self) {}

    /// A timer that never fires.
    #[cfg(test)]
    pub(crate) fn never() -> Self {
        Self {
            rx: crossbeam_channel::never(),
            _alive: None,
        }
    }
}

/// A repeating ticker. Dropping it stops it.
pub struct Ticker {
    rx: Receiver<Instant>,
    _alive: Option<Arc<()>>,
}

impl Ticker {
    pub fn channel(&self) -> &Receiver<Instant> {
        &self.rx
    }

    /// Same as dropping the ticker.
    pub fn stop(self) {}
}

/// Wall clock used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn new_timer(&self, d: Duration) -> Timer {
        Timer {
            rx: crossbeam_channel::after(d),
            _alive: None,
        }
    }

    fn new_ticker(&self, d: Duration) -> Ticker {
        Ticker {
            rx: crossbeam_channel::tick(d),
            _alive: None,
        }
    }
}

struct Waiter {
    target: Instant,
    period: Option<Duration>,
    tx: Sender<Instant>,
    alive: Weak<()>,
}

struct FakeState {
    now: Instant,
    waiters: Vec<Waiter>,
}

/// Manually driven clock for tests.
///
/// Timers fire (in the caller's thread) when `step` or `set_time` moves the
/// clock past their target. Each timer/ticker channel buffers one value, like
/// a Go ticker, so a slow reader skips ticks instead of queueing them.
pub struct FakeClock {
    state: Mutex<FakeState>,
}

impl FakeClock {
    pub fn new(start: Instant) -> Self {
        Self {
            state: Mutex::new(FakeState {
                now: start,
                waiters: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the clock forward by `d`, firing whatever became due.
    pub fn step(&self, d: Duration) {
        let mut state = self.lock();
        let now = state.now + d;
        Self::advance(&mut state, now);
    }

    /// Jump the clock to `t`. Moving backwards only changes `now`.
    pub fn set_time(&self, t: Instant) {
        let mut state = self.lock();
        Self::advance(&mut state, t);
    }

    /// Number of timers and tickers that are still alive.
    pub fn waiters(&self) -> usize {
        let mut state = self.lock();
        state.waiters.retain(|w| w.alive.strong_count() > 0);
        state.waiters.len()
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters() > 0
    }

    fn advance(state: &mut FakeState, now: Instant) {
        state.now = now;
        state.waiters.retain_mut(|w| {
            if w.alive.strong_count() == 0 {
                return false;
            }
            if w.target > now {
                return true;
            }
            let _ = w.tx.try_send(now);
            match w.period {
                Some(period) if !period.is_zero() => {
                    while w.target <= now {
                        w.target += period;
                    }
                    true
                }
                _ => false,
            }
        });
    }

    fn register(
        &self,
        target: impl FnOnce(Instant) -> Instant,
        period: Option<Duration>,
    ) -> (Receiver<Instant>, Arc<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let alive = Arc::new(());
        let mut state = self.lock();
        let target = target(state.now);
        state.waiters.push(Waiter {
            target,
            period,
            tx,
            alive: Arc::downgrade(&alive),
        });
        // a timer that is already due fires right away
        let now = state.now;
        Self::advance(&mut state, now);
        (rx, alive)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.lock().now
    }

    fn new_timer(&self, d: Duration) -> Timer {
        let (rx, alive) = self.register(|now| now + d, None);
        Timer {
            rx,
            _alive: Some(alive),
        }
    }

    // Registered against the deadline itself, so a `step` that races with
    // the caller cannot push the timer back.
    fn new_timer_at(&self, deadline: Instant) -> Timer {
        let (rx, alive) = self.register(|_| deadline, None);
        Timer {
            rx,
            _alive: Some(alive),
        }
    }

    fn new_ticker(&self, d: Duration) -> Ticker {
        let (rx, alive) = self.register(|now| now + d, Some(d));
        Ticker {
            rx,
            _alive: Some(alive),
        }
    }
}
