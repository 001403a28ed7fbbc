//! Timer facade: one-shot, repeating and retaining timers on virtual time,
//! including reset-extension and destruction-detection behavior.

use sequent::test_logging::init_test_logging;
use sequent::{
    Location, OneShotTimer, RepeatingTimer, RetainingOneShotTimer, SequenceManager, TaskQueueSpec,
    TaskRunner, TaskType, TestTickClock, TickClock, TimeTicks,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn timer_fixture() -> (SequenceManager, Arc<TestTickClock>, TaskRunner) {
    init_test_logging();
    let clock = Arc::new(TestTickClock::new());
    let manager = SequenceManager::builder().clock(clock.clone()).build();
    let queue = manager.create_task_queue(TaskQueueSpec::new("timers"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);
    (manager, clock, runner)
}

/// Advances virtual time in 1ms steps, draining ready work at each step, so
/// continuation reposting behaves as it would under a real pump.
fn pump_until(manager: &SequenceManager, clock: &TestTickClock, until: TimeTicks) {
    while clock.now_ticks() < until {
        clock.advance(Duration::from_millis(1));
        manager.run_until_idle();
    }
}

#[test]
fn one_shot_reset_extends_the_deadline() {
    // Scenario: start a 100ms one-shot at t=0, reset at t=50; the callback
    // fires at t>=150.
    let (manager, clock, runner) = timer_fixture();
    let fire_time = Arc::new(Mutex::new(None::<TimeTicks>));

    let mut timer = OneShotTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let observed = Arc::clone(&fire_time);
    let observer_clock = clock.clone();
    timer.start(Location::caller(), Duration::from_millis(100), move || {
        *observed.lock().unwrap() = Some(observer_clock.now_ticks());
    });

    pump_until(&manager, &clock, TimeTicks::from_millis(50));
    assert!(fire_time.lock().unwrap().is_none());
    timer.reset();

    pump_until(&manager, &clock, TimeTicks::from_millis(149));
    assert!(
        fire_time.lock().unwrap().is_none(),
        "reset must extend the deadline"
    );

    pump_until(&manager, &clock, TimeTicks::from_millis(160));
    let fired = fire_time.lock().unwrap().expect("timer fired");
    assert!(fired >= TimeTicks::from_millis(150), "fired at {fired}");
    assert!(!timer.is_running());
}

#[test]
fn repeating_timer_fires_at_each_interval_until_stopped() {
    // Scenario: 10ms repeating timer over 35ms fires at 10, 20, 30.
    let (manager, clock, runner) = timer_fixture();
    let fires = Arc::new(Mutex::new(Vec::new()));

    let mut timer = RepeatingTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let observed = Arc::clone(&fires);
    let observer_clock = clock.clone();
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        observed.lock().unwrap().push(observer_clock.now_ticks());
    });

    pump_until(&manager, &clock, TimeTicks::from_millis(35));
    timer.stop();
    pump_until(&manager, &clock, TimeTicks::from_millis(60));

    let fires = fires.lock().unwrap();
    assert_eq!(
        fires.as_slice(),
        &[
            TimeTicks::from_millis(10),
            TimeTicks::from_millis(20),
            TimeTicks::from_millis(30)
        ]
    );
}

#[test]
fn repeating_callback_may_destroy_its_own_timer() {
    let (manager, clock, runner) = timer_fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let slot: Arc<Mutex<Option<RepeatingTimer>>> = Arc::new(Mutex::new(None));
    let mut timer = RepeatingTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let count = fired.clone();
    let slot_in_callback = Arc::clone(&slot);
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        count.fetch_add(1, Ordering::SeqCst);
        // Dropping the timer from inside its own callback must be safe.
        slot_in_callback.lock().unwrap().take();
    });
    *slot.lock().unwrap() = Some(timer);

    pump_until(&manager, &clock, TimeTicks::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(slot.lock().unwrap().is_none());
}

#[test]
fn one_shot_restart_replaces_callback_and_deadline() {
    let (manager, clock, runner) = timer_fixture();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut timer = OneShotTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let first = Arc::clone(&log);
    timer.start(Location::caller(), Duration::from_millis(30), move || {
        first.lock().unwrap().push("first");
    });
    // Restart with a shorter delay before the first fire.
    let second = Arc::clone(&log);
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        second.lock().unwrap().push("second");
    });

    pump_until(&manager, &clock, TimeTicks::from_millis(40));
    assert_eq!(log.lock().unwrap().as_slice(), &["second"]);
}

#[test]
fn stop_then_restart_a_one_shot() {
    let (manager, clock, runner) = timer_fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut timer = OneShotTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let count = fired.clone();
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    timer.stop();
    pump_until(&manager, &clock, TimeTicks::from_millis(20));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let count = fired.clone();
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    pump_until(&manager, &clock, TimeTicks::from_millis(40));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn retaining_timer_reuses_callback_after_stop() {
    let (manager, clock, runner) = timer_fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut timer = RetainingOneShotTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let count = fired.clone();
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    timer.stop();
    pump_until(&manager, &clock, TimeTicks::from_millis(20));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // The callback survived the stop; reset re-arms without a new one.
    timer.reset();
    pump_until(&manager, &clock, TimeTicks::from_millis(40));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn fire_now_runs_immediately_and_stops() {
    let (_manager, clock, runner) = timer_fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut timer = OneShotTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let count = fired.clone();
    timer.start(Location::caller(), Duration::from_secs(1), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    timer.fire_now();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!timer.is_running());
}

#[test]
fn manager_teardown_stops_armed_timers() {
    let (manager, clock, runner) = timer_fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut timer = OneShotTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let count = fired.clone();
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    assert!(timer.is_running());

    // Dropping the manager destroys the scheduled task without running it;
    // the destruction detector stops the timer and releases the callback.
    drop(manager);
    assert!(!timer.is_running());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn timer_dropped_before_fire_never_runs() {
    let (manager, clock, runner) = timer_fixture();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut timer = OneShotTimer::with_clock(clock.clone());
    timer.set_task_runner(runner);
    let count = fired.clone();
    timer.start(Location::caller(), Duration::from_millis(10), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    drop(timer);

    pump_until(&manager, &clock, TimeTicks::from_millis(30));
    assert_eq!(
        fired.load(Ordering::SeqCst),
        0,
        "a dead timer's scheduled task must be inert"
    );
}
