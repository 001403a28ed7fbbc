//! Timers built on top of task runners.
//!
//! Three variants share one engine:
//!
//! - [`OneShotTimer`]: runs its callback once at `now + delay`, then stops.
//! - [`RepeatingTimer`]: re-arms itself with the same delay *before*
//!   invoking the callback, so the callback may safely destroy the timer.
//! - [`RetainingOneShotTimer`]: like one-shot but keeps the callback across
//!   stops, so it can be restarted without re-supplying it.
//!
//! The engine posts a scheduled task per arming. `Reset` that pushes the
//! deadline *later* does not repost: the already-scheduled task notices the
//! extended `desired_run_time` when it fires and posts a continuation for
//! the remainder. A destruction guard travels with every scheduled task: if
//! the task is destroyed without running (queue shutdown, manager teardown),
//! the guard stops the timer and releases the user callback. Scheduled tasks
//! hold only weak references to the timer, so firing after the timer died is
//! impossible.

use crate::task::{Callback, Location};
use crate::time::{MonotonicClock, TickClock, TimeTicks};
use crate::runner::TaskRunner;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    OneShot,
    Repeating,
    RetainingOneShot,
}

enum UserTask {
    None,
    Once(Box<dyn FnOnce() + Send>),
    Repeating(Arc<dyn Fn() + Send + Sync>),
}

impl UserTask {
    fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

struct TimerInner {
    kind: TimerKind,
    is_running: bool,
    delay: Duration,
    posted_from: Location,
    /// When the user last asked the timer to fire.
    desired_run_time: TimeTicks,
    /// When the currently scheduled task will fire. `ZERO` for an immediate
    /// schedule.
    scheduled_run_time: TimeTicks,
    /// A scheduled task exists whose destruction guard is still armed.
    has_scheduled_task: bool,
    /// Bumped on abandon; stale scheduled tasks and guards compare against
    /// it and turn into no-ops.
    generation: u64,
    user_task: UserTask,
    task_runner: Option<TaskRunner>,
    clock: Arc<dyn TickClock>,
}

type SharedInner = Arc<Mutex<TimerInner>>;

/// Detects a scheduled task that is destroyed without ever running.
struct ScheduledTaskGuard {
    timer: Weak<Mutex<TimerInner>>,
    generation: u64,
    armed: bool,
}

impl ScheduledTaskGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ScheduledTaskGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(inner) = self.timer.upgrade() else {
            return;
        };
        // The scheduled task died unexecuted: abandon and stop the timer.
        // The user callback is dropped outside the lock.
        let released = {
            let mut inner = inner.lock();
            if self.generation != inner.generation {
                return;
            }
            inner.has_scheduled_task = false;
            inner.generation += 1;
            inner.is_running = false;
            if inner.kind == TimerKind::OneShot {
                std::mem::replace(&mut inner.user_task, UserTask::None)
            } else {
                UserTask::None
            }
        };
        drop(released);
    }
}

enum FireAction {
    /// The deadline was extended; continue for the remainder.
    Continue(Duration),
    Run,
    Nothing,
}

struct TimerCore {
    inner: SharedInner,
}

impl TimerCore {
    fn new(kind: TimerKind, clock: Arc<dyn TickClock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                kind,
                is_running: false,
                delay: Duration::ZERO,
                posted_from: Location::caller(),
                desired_run_time: TimeTicks::ZERO,
                scheduled_run_time: TimeTicks::ZERO,
                has_scheduled_task: false,
                generation: 0,
                user_task: UserTask::None,
                task_runner: None,
                clock,
            })),
        }
    }

    fn is_running(&self) -> bool {
        self.inner.lock().is_running
    }

    fn current_delay(&self) -> Duration {
        self.inner.lock().delay
    }

    fn set_task_runner(&self, runner: TaskRunner) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.is_running,
            "the task runner must be set before the timer is started"
        );
        inner.task_runner = Some(runner);
    }

    fn start(&self, posted_from: Location, delay: Duration, user_task: UserTask) {
        {
            let mut inner = self.inner.lock();
            inner.posted_from = posted_from;
            inner.delay = delay;
            inner.user_task = user_task;
        }
        self.reset();
    }

    fn stop(&self) {
        let released = {
            let mut inner = self.inner.lock();
            inner.is_running = false;
            if inner.kind == TimerKind::OneShot {
                std::mem::replace(&mut inner.user_task, UserTask::None)
            } else {
                UserTask::None
            }
        };
        drop(released);
    }

    fn reset(&self) {
        let repost_delay = {
            let mut inner = self.inner.lock();
            assert!(
                !inner.user_task.is_none(),
                "timer reset without a user task; call start first"
            );
            if !inner.has_scheduled_task {
                Some(inner.delay)
            } else {
                inner.desired_run_time = if inner.delay.is_zero() {
                    TimeTicks::ZERO
                } else {
                    inner.clock.now_ticks().saturating_add(inner.delay)
                };
                if inner.desired_run_time >= inner.scheduled_run_time {
                    // The scheduled task arrives no later than the new
                    // deadline; it will post a continuation if needed.
                    inner.is_running = true;
                    None
                } else {
                    Self::abandon_scheduled_task_locked(&mut inner);
                    Some(inner.delay)
                }
            }
        };
        if let Some(delay) = repost_delay {
            Self::post_scheduled_task(&self.inner, delay);
        }
    }

    fn abandon_scheduled_task(&self) {
        let mut inner = self.inner.lock();
        Self::abandon_scheduled_task_locked(&mut inner);
    }

    fn abandon_scheduled_task_locked(inner: &mut TimerInner) {
        if inner.has_scheduled_task {
            inner.has_scheduled_task = false;
            inner.generation += 1;
        }
    }

    fn post_scheduled_task(shared: &SharedInner, delay: Duration) {
        let (runner, posted_from, guard) = {
            let mut inner = shared.lock();
            debug_assert!(!inner.has_scheduled_task);
            inner.is_running = true;
            inner.has_scheduled_task = true;
            if delay.is_zero() {
                inner.scheduled_run_time = TimeTicks::ZERO;
                inner.desired_run_time = TimeTicks::ZERO;
            } else {
                let now = inner.clock.now_ticks();
                inner.scheduled_run_time = now.saturating_add(delay);
                inner.desired_run_time = inner.scheduled_run_time;
            }
            let guard = ScheduledTaskGuard {
                timer: Arc::downgrade(shared),
                generation: inner.generation,
                armed: true,
            };
            let runner = inner
                .task_runner
                .clone()
                .expect("timer started without a task runner");
            (runner, inner.posted_from, guard)
        };

        let weak = Arc::downgrade(shared);
        let mut guard = guard;
        let callback = Callback::new(move || {
            Self::on_scheduled_task_invoked(&weak, &mut guard);
        });
        // A rejected post drops the callback, which trips the guard and
        // stops the timer.
        if delay.is_zero() {
            runner.post_task(posted_from, callback);
        } else {
            runner.post_delayed_task(posted_from, callback, delay);
        }
    }

    fn on_scheduled_task_invoked(weak: &Weak<Mutex<TimerInner>>, guard: &mut ScheduledTaskGuard) {
        guard.disarm();
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let action = {
            let mut inner = shared.lock();
            if guard.generation != inner.generation {
                // This task was abandoned; a fresh one is in flight.
                return;
            }
            inner.has_scheduled_task = false;
            if !inner.is_running {
                FireAction::Nothing
            } else if inner.desired_run_time > inner.scheduled_run_time {
                let now = inner.clock.now_ticks();
                if inner.desired_run_time > now {
                    FireAction::Continue(inner.desired_run_time.saturating_since(now))
                } else {
                    FireAction::Run
                }
            } else {
                FireAction::Run
            }
        };
        match action {
            FireAction::Nothing => {}
            FireAction::Continue(remaining) => Self::post_scheduled_task(&shared, remaining),
            FireAction::Run => Self::run_user_task(&shared),
        }
    }

    /// Runs the user callback with no lock held; the callback may destroy
    /// the timer, so nothing is touched afterwards.
    fn run_user_task(shared: &SharedInner) {
        enum Fire {
            Once(Box<dyn FnOnce() + Send>),
            Shared(Arc<dyn Fn() + Send + Sync>),
        }
        let (fire, rearm_delay) = {
            let mut inner = shared.lock();
            match inner.kind {
                TimerKind::OneShot => {
                    let task = std::mem::replace(&mut inner.user_task, UserTask::None);
                    inner.is_running = false;
                    let UserTask::Once(f) = task else {
                        panic!("one-shot timer fired without a callback");
                    };
                    (Fire::Once(f), None)
                }
                TimerKind::Repeating => {
                    let UserTask::Repeating(f) = &inner.user_task else {
                        panic!("repeating timer fired without a callback");
                    };
                    (Fire::Shared(Arc::clone(f)), Some(inner.delay))
                }
                TimerKind::RetainingOneShot => {
                    let UserTask::Repeating(f) = &inner.user_task else {
                        panic!("retaining timer fired without a callback");
                    };
                    let f = Arc::clone(f);
                    inner.is_running = false;
                    (Fire::Shared(f), None)
                }
            }
        };
        // A repeating timer re-arms before invoking, so the callback can
        // stop or destroy it without racing the continuation.
        if let Some(delay) = rearm_delay {
            Self::post_scheduled_task(shared, delay);
        }
        match fire {
            Fire::Once(f) => f(),
            Fire::Shared(f) => f(),
        }
    }
}

impl Drop for TimerCore {
    fn drop(&mut self) {
        self.abandon_scheduled_task();
    }
}

/// Runs a callback once after a delay.
pub struct OneShotTimer {
    core: TimerCore,
}

impl Default for OneShotTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotTimer {
    /// A timer on the real monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// A timer on a caller-supplied clock (tests use the same test clock as
    /// the manager under test).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn TickClock>) -> Self {
        Self {
            core: TimerCore::new(TimerKind::OneShot, clock),
        }
    }

    /// Routes scheduled tasks to `runner`. Must be called before `start`.
    pub fn set_task_runner(&mut self, runner: TaskRunner) {
        self.core.set_task_runner(runner);
    }

    /// Arms the timer to run `callback` once, `delay` from now. Restarting
    /// replaces the callback and the deadline.
    pub fn start(
        &mut self,
        posted_from: Location,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) {
        self.core
            .start(posted_from, delay, UserTask::Once(Box::new(callback)));
    }

    /// Runs the callback now, ignoring the remaining delay. Panics if the
    /// timer is not running.
    pub fn fire_now(&mut self) {
        assert!(self.core.is_running(), "fire_now on a stopped timer");
        TimerCore::run_user_task(&self.core.inner);
    }

    /// Stops the timer and releases the callback without running it.
    pub fn stop(&mut self) {
        self.core.stop();
    }

    /// Re-arms the timer for a full delay from now.
    pub fn reset(&mut self) {
        self.core.reset();
    }

    /// True while a fire is pending.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// The configured delay.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.core.current_delay()
    }
}

/// Runs a callback at a fixed interval until stopped.
pub struct RepeatingTimer {
    core: TimerCore,
}

impl Default for RepeatingTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RepeatingTimer {
    /// A timer on the real monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// A timer on a caller-supplied clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn TickClock>) -> Self {
        Self {
            core: TimerCore::new(TimerKind::Repeating, clock),
        }
    }

    /// Routes scheduled tasks to `runner`. Must be called before `start`.
    pub fn set_task_runner(&mut self, runner: TaskRunner) {
        self.core.set_task_runner(runner);
    }

    /// Arms the timer to run `callback` every `delay`.
    pub fn start(
        &mut self,
        posted_from: Location,
        delay: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        self.core
            .start(posted_from, delay, UserTask::Repeating(Arc::new(callback)));
    }

    /// Stops the timer; the callback is released.
    pub fn stop(&mut self) {
        self.core.stop();
    }

    /// Restarts the interval from now.
    pub fn reset(&mut self) {
        self.core.reset();
    }

    /// True while the timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// The configured interval.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.core.current_delay()
    }
}

/// A one-shot timer that retains its callback across stops.
pub struct RetainingOneShotTimer {
    core: TimerCore,
}

impl Default for RetainingOneShotTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RetainingOneShotTimer {
    /// A timer on the real monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// A timer on a caller-supplied clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn TickClock>) -> Self {
        Self {
            core: TimerCore::new(TimerKind::RetainingOneShot, clock),
        }
    }

    /// Routes scheduled tasks to `runner`. Must be called before `start`.
    pub fn set_task_runner(&mut self, runner: TaskRunner) {
        self.core.set_task_runner(runner);
    }

    /// Arms the timer; the callback survives stops and later resets.
    pub fn start(
        &mut self,
        posted_from: Location,
        delay: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        self.core
            .start(posted_from, delay, UserTask::Repeating(Arc::new(callback)));
    }

    /// Stops the timer, keeping the callback for a later reset.
    pub fn stop(&mut self) {
        self.core.stop();
    }

    /// Re-arms the timer with the retained callback.
    pub fn reset(&mut self) {
        self.core.reset();
    }

    /// True while a fire is pending.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// The configured delay.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.core.current_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueueSpec;
    use crate::task::TaskType;
    use crate::time::TestTickClock;
    use crate::SequenceManager;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_manager() -> (SequenceManager, Arc<TestTickClock>) {
        let clock = Arc::new(TestTickClock::new());
        let manager = SequenceManager::builder().clock(clock.clone()).build();
        (manager, clock)
    }

    #[test]
    fn one_shot_fires_once_after_delay() {
        let (manager, clock) = test_manager();
        let queue = manager.create_task_queue(TaskQueueSpec::new("timers"));
        let runner = queue.create_task_runner(TaskType::DEFAULT);

        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = OneShotTimer::with_clock(clock.clone());
        timer.set_task_runner(runner);
        let count = fired.clone();
        timer.start(Location::caller(), Duration::from_millis(100), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_running());

        clock.advance(Duration::from_millis(99));
        manager.run_until_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(1));
        manager.run_until_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[test]
    fn stop_releases_the_callback() {
        let (manager, clock) = test_manager();
        let queue = manager.create_task_queue(TaskQueueSpec::new("timers"));
        let runner = queue.create_task_runner(TaskType::DEFAULT);

        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = OneShotTimer::with_clock(clock.clone());
        timer.set_task_runner(runner);
        let count = fired.clone();
        timer.start(Location::caller(), Duration::from_millis(10), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();
        assert!(!timer.is_running());

        clock.advance(Duration::from_millis(20));
        manager.run_until_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn queue_teardown_trips_the_destruction_guard() {
        let (manager, clock) = test_manager();
        let queue = manager.create_task_queue(TaskQueueSpec::new("timers"));
        let runner = queue.create_task_runner(TaskType::DEFAULT);

        let mut timer = OneShotTimer::with_clock(clock.clone());
        timer.set_task_runner(runner);
        timer.start(Location::caller(), Duration::from_millis(10), || {});
        assert!(timer.is_running());

        // Unregistration destroys the scheduled task without running it.
        queue.unregister();
        assert!(!timer.is_running());
    }

    #[test]
    fn retaining_timer_restarts_without_new_callback() {
        let (manager, clock) = test_manager();
        let queue = manager.create_task_queue(TaskQueueSpec::new("timers"));
        let runner = queue.create_task_runner(TaskType::DEFAULT);

        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RetainingOneShotTimer::with_clock(clock.clone());
        timer.set_task_runner(runner);
        let count = fired.clone();
        timer.start(Location::caller(), Duration::from_millis(10), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        clock.advance(Duration::from_millis(10));
        manager.run_until_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());

        timer.reset();
        assert!(timer.is_running());
        clock.advance(Duration::from_millis(10));
        manager.run_until_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
