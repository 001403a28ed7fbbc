//! The seam between the sequence manager and whatever drives its thread.
//!
//! The manager never sleeps on its own: when it runs out of ready work it
//! hands the next wake-up deadline to a [`ThreadController`] and yields. The
//! built-in [`ParkingController`] parks the thread on a condvar until an
//! external [`schedule_work`](ThreadController::schedule_work) arrives or the
//! deadline passes; embedders with their own message pump can substitute a
//! controller that forwards both signals to it.

use crate::time::{TickClock, TimeTicks};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Wakes and re-arms the thread the manager is bound to.
///
/// `schedule_work` may be called from any thread; the other methods are
/// called on the main thread only.
pub trait ThreadController: Send + Sync {
    /// Requests an immediate dispatch. Must coalesce: waking an
    /// already-woken controller is cheap and spurious wakes are tolerated.
    fn schedule_work(&self);

    /// Programs (or cancels, with `None`) the deadline after which delayed
    /// work becomes ready.
    fn set_next_delayed_do_work(&self, run_time: Option<TimeTicks>);

    /// Blocks until work is scheduled or the programmed deadline passes.
    fn wait_for_work(&self, clock: &dyn TickClock);
}

#[derive(Debug, Default)]
struct ParkingState {
    work_scheduled: bool,
    next_delayed_do_work: Option<TimeTicks>,
}

/// Condvar-based controller for threads fully owned by the manager.
///
/// Wait deadlines are converted to real sleep durations, so this controller
/// only makes sense over a clock that advances in real time. Drivers on
/// virtual time poll with `run_until_idle` instead of blocking here.
#[derive(Debug, Default)]
pub struct ParkingController {
    state: Mutex<ParkingState>,
    wake: Condvar,
}

impl ParkingController {
    /// Creates a parked controller with no pending work signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadController for ParkingController {
    fn schedule_work(&self) {
        let mut state = self.state.lock();
        if !state.work_scheduled {
            state.work_scheduled = true;
            self.wake.notify_one();
        }
    }

    fn set_next_delayed_do_work(&self, run_time: Option<TimeTicks>) {
        let mut state = self.state.lock();
        if state.next_delayed_do_work != run_time {
            state.next_delayed_do_work = run_time;
            // Wake the waiter so it recomputes its deadline.
            self.wake.notify_one();
        }
    }

    fn wait_for_work(&self, clock: &dyn TickClock) {
        let mut state = self.state.lock();
        loop {
            if state.work_scheduled {
                state.work_scheduled = false;
                return;
            }
            match state.next_delayed_do_work {
                None => {
                    self.wake.wait(&mut state);
                }
                Some(deadline) => {
                    let now = clock.now_ticks();
                    if deadline <= now {
                        return;
                    }
                    let timeout = deadline.saturating_since(now);
                    if self.wake.wait_for(&mut state, timeout).timed_out() {
                        return;
                    }
                }
            }
        }
    }
}

/// A controller that records signals without blocking, for drivers that poll
/// the manager themselves (tests, embedders with external pumps).
#[derive(Debug, Default)]
pub struct RecordingController {
    state: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    schedule_work_count: u64,
    next_delayed_do_work: Option<TimeTicks>,
}

impl RecordingController {
    /// Creates a recording controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `schedule_work` was called.
    #[must_use]
    pub fn schedule_work_count(&self) -> u64 {
        self.state.lock().schedule_work_count
    }

    /// The last programmed delayed-work deadline.
    #[must_use]
    pub fn next_delayed_do_work(&self) -> Option<TimeTicks> {
        self.state.lock().next_delayed_do_work
    }
}

impl ThreadController for RecordingController {
    fn schedule_work(&self) {
        self.state.lock().schedule_work_count += 1;
    }

    fn set_next_delayed_do_work(&self, run_time: Option<TimeTicks>) {
        self.state.lock().next_delayed_do_work = run_time;
    }

    fn wait_for_work(&self, _clock: &dyn TickClock) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{MonotonicClock, TestTickClock};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn schedule_work_wakes_waiter() {
        let controller = Arc::new(ParkingController::new());
        let waker = Arc::clone(&controller);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waker.schedule_work();
        });
        // Without a deadline this would park forever unless woken.
        controller.wait_for_work(&MonotonicClock::new());
        handle.join().unwrap();
    }

    #[test]
    fn deadline_in_past_returns_immediately() {
        let controller = ParkingController::new();
        let clock = TestTickClock::starting_at(TimeTicks::from_millis(100));
        controller.set_next_delayed_do_work(Some(TimeTicks::from_millis(50)));
        controller.wait_for_work(&clock);
    }

    #[test]
    fn work_signal_is_consumed_once() {
        let controller = ParkingController::new();
        let clock = TestTickClock::new();
        controller.schedule_work();
        controller.wait_for_work(&clock);
        // Second wait would block; give it a past deadline to fall through.
        controller.set_next_delayed_do_work(Some(TimeTicks::ZERO));
        controller.wait_for_work(&clock);
    }

    #[test]
    fn recording_controller_counts_signals() {
        let controller = RecordingController::new();
        controller.schedule_work();
        controller.schedule_work();
        controller.set_next_delayed_do_work(Some(TimeTicks::from_millis(5)));
        assert_eq!(controller.schedule_work_count(), 2);
        assert_eq!(
            controller.next_delayed_do_work(),
            Some(TimeTicks::from_millis(5))
        );
    }
}
