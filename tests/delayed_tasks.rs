//! Delay ordering: deadlines respected on virtual time, wake-up heap
//! bookkeeping, high-resolution accounting and cancelled-task reclamation.

use sequent::test_logging::init_test_logging;
use sequent::{
    Callback, Location, QueueObserver, SequenceManager, TaskQueueSpec, TaskType, TestTickClock,
    TickClock, TimeTicks,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_manager() -> (SequenceManager, Arc<TestTickClock>) {
    init_test_logging();
    let clock = Arc::new(TestTickClock::new());
    let manager = SequenceManager::builder().clock(clock.clone()).build();
    (manager, clock)
}

fn record(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> impl FnOnce() + Send {
    let log = Arc::clone(log);
    move || log.lock().unwrap().push(label)
}

fn names(log: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
    log.lock().unwrap().clone()
}

#[test]
fn delayed_tasks_fire_in_deadline_order() {
    // Scenario: post A(30ms), B(10ms), C(20ms); at 25ms B and C ran, at 30ms
    // A joins them.
    let (manager, clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    let log = Arc::new(Mutex::new(Vec::new()));
    runner.post_delayed_task(Location::caller(), record(&log, "a"), Duration::from_millis(30));
    runner.post_delayed_task(Location::caller(), record(&log, "b"), Duration::from_millis(10));
    runner.post_delayed_task(Location::caller(), record(&log, "c"), Duration::from_millis(20));

    clock.advance(Duration::from_millis(25));
    manager.run_until_idle();
    assert_eq!(names(&log), vec!["b", "c"]);

    clock.advance(Duration::from_millis(5));
    manager.run_until_idle();
    assert_eq!(names(&log), vec!["b", "c", "a"]);
}

#[test]
fn delayed_task_never_runs_before_its_deadline() {
    let (manager, clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    let fire_time = Arc::new(Mutex::new(None::<TimeTicks>));
    let observed = Arc::clone(&fire_time);
    let observer_clock = clock.clone();
    let posted_at = clock.now_ticks();
    runner.post_delayed_task(
        Location::caller(),
        move || {
            *observed.lock().unwrap() = Some(observer_clock.now_ticks());
        },
        Duration::from_millis(40),
    );

    for _ in 0..10 {
        clock.advance(Duration::from_millis(5));
        manager.run_until_idle();
    }
    let fired = fire_time.lock().unwrap().expect("task fired");
    assert!(fired >= posted_at.saturating_add(Duration::from_millis(40)));
}

#[test]
fn delayed_and_immediate_tasks_merge_in_commit_order() {
    let (manager, clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    let log = Arc::new(Mutex::new(Vec::new()));
    runner.post_delayed_task(
        Location::caller(),
        record(&log, "delayed"),
        Duration::from_millis(10),
    );
    runner.post_task(Location::caller(), record(&log, "immediate-1"));
    clock.advance(Duration::from_millis(10));
    // The delayed task is committed during this drain, after immediate-1
    // (already staged) but before immediate-2 (posted later).
    manager.run_until_idle();
    runner.post_task(Location::caller(), record(&log, "immediate-2"));
    manager.run_until_idle();

    assert_eq!(names(&log), vec!["immediate-1", "delayed", "immediate-2"]);
}

#[test]
fn wake_up_heap_tracks_earliest_enabled_queue() {
    let (manager, _clock) = test_manager();
    let q1 = manager.create_task_queue(TaskQueueSpec::new("q1"));
    let q2 = manager.create_task_queue(TaskQueueSpec::new("q2"));
    let r1 = q1.create_task_runner(TaskType::DEFAULT);
    let r2 = q2.create_task_runner(TaskType::DEFAULT);

    assert_eq!(manager.next_scheduled_run_time(), None);

    r1.post_delayed_task(Location::caller(), || {}, Duration::from_millis(50));
    r2.post_delayed_task(Location::caller(), || {}, Duration::from_millis(20));
    assert_eq!(
        manager.next_scheduled_run_time(),
        Some(TimeTicks::from_millis(20))
    );

    // Disabling the earlier queue removes its wake-up from the heap.
    q2.set_queue_enabled(false);
    assert_eq!(
        manager.next_scheduled_run_time(),
        Some(TimeTicks::from_millis(50))
    );
    q2.set_queue_enabled(true);
    assert_eq!(
        manager.next_scheduled_run_time(),
        Some(TimeTicks::from_millis(20))
    );
}

#[test]
fn high_resolution_counter_matches_pending_tasks() {
    let (manager, clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    // Below the 32ms threshold: high resolution. At or above: low.
    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(5));
    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(31));
    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(32));
    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(100));
    assert_eq!(queue.pending_high_resolution_task_count(), 2);

    let domain = manager.default_time_domain();
    assert_eq!(domain.pending_high_res_wake_up_count(), 1);

    clock.advance(Duration::from_millis(31));
    manager.run_until_idle();
    assert_eq!(queue.pending_high_resolution_task_count(), 0);
    assert_eq!(domain.pending_high_res_wake_up_count(), 0);
}

#[test]
fn low_priority_queues_do_not_request_high_resolution() {
    let (manager, _clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    queue.set_queue_priority(sequent::QueuePriority::Low);
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(5));
    assert_eq!(queue.pending_high_resolution_task_count(), 1);
    // The wake-up itself is low resolution: precision is wasted on a queue
    // below normal priority.
    assert_eq!(
        manager.default_time_domain().pending_high_res_wake_up_count(),
        0
    );
}

#[test]
fn reclaim_memory_sweeps_cancelled_delayed_tasks() {
    let (manager, clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    let fired = Arc::new(AtomicUsize::new(0));
    let owner = Arc::new(());
    for _ in 0..3 {
        let count = fired.clone();
        runner.post_posted_task(sequent::PostedTask {
            callback: Callback::bound(&owner, move || {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            posted_from: Location::caller(),
            delay: Duration::from_millis(50),
            nestable: sequent::Nestable::Nestable,
            task_type: TaskType::DEFAULT,
            queue_time: None,
            ipc_hash: None,
        });
    }
    assert_eq!(queue.number_of_pending_tasks(), 3);

    // Dropping the owner cancels all three callbacks; the sweep removes
    // them without running anything.
    drop(owner);
    queue.reclaim_memory(clock.now_ticks());
    assert_eq!(queue.number_of_pending_tasks(), 0);

    clock.advance(Duration::from_millis(60));
    manager.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn cancelled_task_at_heap_top_is_skipped_during_promotion() {
    let (manager, clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    let log = Arc::new(Mutex::new(Vec::new()));
    let owner = Arc::new(());
    runner.post_posted_task(sequent::PostedTask {
        callback: Callback::bound(&owner, {
            let log = Arc::clone(&log);
            move || log.lock().unwrap().push("cancelled")
        }),
        posted_from: Location::caller(),
        delay: Duration::from_millis(10),
        nestable: sequent::Nestable::Nestable,
        task_type: TaskType::DEFAULT,
        queue_time: None,
        ipc_hash: None,
    });
    runner.post_delayed_task(
        Location::caller(),
        record(&log, "live"),
        Duration::from_millis(20),
    );
    drop(owner);

    clock.advance(Duration::from_millis(25));
    manager.run_until_idle();
    assert_eq!(names(&log), vec!["live"]);
}

#[test]
fn queue_observer_hears_wake_up_changes() {
    #[derive(Default)]
    struct RecordingObserver {
        changes: Mutex<Vec<Option<TimeTicks>>>,
    }
    impl QueueObserver for RecordingObserver {
        fn on_queue_next_wake_up_changed(&self, wake_up: Option<TimeTicks>) {
            self.changes.lock().unwrap().push(wake_up);
        }
    }

    let (manager, _clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);
    let observer = Arc::new(RecordingObserver::default());
    queue.set_observer(Some(observer.clone()));

    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(30));
    {
        let changes = observer.changes.lock().unwrap();
        assert_eq!(changes.as_slice(), &[Some(TimeTicks::from_millis(30))]);
    }

    // An earlier deadline re-notifies; a later one does not (the earliest
    // pending wake-up is unchanged).
    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(60));
    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(10));
    let changes = observer.changes.lock().unwrap();
    assert_eq!(
        changes.as_slice(),
        &[
            Some(TimeTicks::from_millis(30)),
            Some(TimeTicks::from_millis(10))
        ]
    );
}

#[test]
fn is_empty_and_pending_counts_cover_all_internal_queues() {
    let (manager, clock) = test_manager();
    let queue = manager.create_task_queue(TaskQueueSpec::new("q"));
    let runner = queue.create_task_runner(TaskType::DEFAULT);

    assert!(queue.is_empty());
    assert!(!queue.has_task_to_run_immediately());

    runner.post_task(Location::caller(), || {});
    runner.post_delayed_task(Location::caller(), || {}, Duration::from_millis(10));
    assert!(!queue.is_empty());
    assert_eq!(queue.number_of_pending_tasks(), 2);
    assert!(queue.has_task_to_run_immediately());

    manager.run_until_idle();
    assert_eq!(queue.number_of_pending_tasks(), 1);
    assert!(!queue.has_task_to_run_immediately());

    clock.advance(Duration::from_millis(10));
    assert!(queue.has_task_to_run_immediately());
    manager.run_until_idle();
    assert!(queue.is_empty());
}
