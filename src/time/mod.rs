//! Monotonic time for the sequencing core.
//!
//! Everything in this crate measures time as [`TimeTicks`]: a monotonic
//! microsecond count read from a [`TickClock`]. Clocks are pluggable so a
//! whole manager (and all of its timers) can run on test-controlled virtual
//! time.

pub mod clock;

pub use clock::{MonotonicClock, TestTickClock, TickClock};

use core::fmt;
use std::time::Duration;

/// A point on a monotonic clock, in microseconds since the clock's epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize,
)]
#[serde(transparent)]
pub struct TimeTicks(u64);

impl TimeTicks {
    /// The clock epoch.
    pub const ZERO: Self = Self(0);
    /// The far future.
    pub const MAX: Self = Self(u64::MAX);

    /// Constructs a tick count from raw microseconds.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Constructs a tick count from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000)
    }

    /// Constructs a tick count from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Returns the raw microsecond count.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Saturating advance by a duration.
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let micros = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    #[must_use]
    pub fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Fractional milliseconds since the epoch, for tracing snapshots.
    #[must_use]
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / 1_000.0
    }
}

impl fmt::Display for TimeTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Resolution requested for a wake-up.
///
/// Delays short enough that low-resolution platform timers would miss them by
/// a large relative error are flagged high resolution; the time domain counts
/// them so a driver can raise timer resolution while any are pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeUpResolution {
    /// Default platform timer granularity is fine.
    Low,
    /// The wake-up needs a fine-grained timer.
    High,
}

/// A scheduled wake-up for a task queue: the earliest delayed run time plus
/// the resolution it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeUp {
    /// When the queue's earliest delayed task becomes due.
    pub time: TimeTicks,
    /// Timer resolution needed to honor `time`.
    pub resolution: WakeUpResolution,
}

/// Delays strictly below this threshold mark their task high resolution.
///
/// Twice the 16ms low-resolution tick; a shorter wait on a coarse timer can
/// overshoot by more than half the requested delay.
pub const HIGH_RESOLUTION_THRESHOLD: Duration = Duration::from_millis(32);

/// A lazily-sampled "now" that amortizes clock reads across one pass of
/// work-queue maintenance.
pub struct LazyNow<'a> {
    clock: &'a dyn TickClock,
    now: Option<TimeTicks>,
}

impl<'a> LazyNow<'a> {
    /// Creates a lazy sampler over `clock`.
    #[must_use]
    pub fn new(clock: &'a dyn TickClock) -> Self {
        Self { clock, now: None }
    }

    /// Creates a sampler pre-seeded with a known timestamp.
    #[must_use]
    pub fn with_now(clock: &'a dyn TickClock, now: TimeTicks) -> Self {
        Self {
            clock,
            now: Some(now),
        }
    }

    /// Returns the sampled time, reading the clock on first use.
    pub fn now(&mut self) -> TimeTicks {
        *self.now.get_or_insert_with(|| self.clock.now_ticks())
    }

    /// Returns the sample if the clock has already been read.
    #[must_use]
    pub fn peek(&self) -> Option<TimeTicks> {
        self.now
    }
}
