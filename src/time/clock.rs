//! Tick clocks.

use super::TimeTicks;
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A source of monotonic [`TimeTicks`].
///
/// Implementations must be cheap to query and safe to share across threads;
/// cross-thread posting reads the clock under the queue's any-thread lock.
pub trait TickClock: Send + Sync {
    /// Returns the current tick count.
    fn now_ticks(&self) -> TimeTicks;
}

/// The process-wide monotonic clock, anchored at first use.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Creates the real clock.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl TickClock for MonotonicClock {
    fn now_ticks(&self) -> TimeTicks {
        let elapsed = process_epoch().elapsed();
        TimeTicks::from_micros(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
    }
}

/// A manually-advanced clock for tests.
///
/// Typically shared as an `Arc<TestTickClock>` between the test body and the
/// manager under test; all holders observe the same time.
#[derive(Debug, Default)]
pub struct TestTickClock {
    now: Mutex<TimeTicks>,
}

impl TestTickClock {
    /// Creates a clock at [`TimeTicks::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock at a given start time.
    #[must_use]
    pub fn starting_at(now: TimeTicks) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(delta);
    }

    /// Sets the clock to an absolute value. Panics if time would move
    /// backwards.
    pub fn set_now(&self, now: TimeTicks) {
        let mut current = self.now.lock();
        assert!(now >= *current, "test clock must not move backwards");
        *current = now;
    }
}

impl TickClock for TestTickClock {
    fn now_ticks(&self) -> TimeTicks {
        *self.now.lock()
    }
}
