//! The sequence manager: queue ownership, ordering, and the work loop.
//!
//! One [`SequenceManager`] is bound to the thread that creates it. It
//! allocates enqueue orders from a single atomic counter, owns the task
//! queues and time domains, drains the "empty queues to reload" flag set,
//! promotes due delayed tasks, selects the highest-priority ready task and
//! runs it. Everything posted anywhere funnels into this loop; nothing ever
//! runs on another thread.
//!
//! Lock discipline: the core lock is held only between tasks, never while a
//! task callback or observer runs. Cross-thread posters take exactly one
//! lock (their queue's), so no path can cycle against the core.

use crate::controller::{ParkingController, ThreadController};
use crate::error::Error;
use crate::observability::{LogCollector, LogEntry, LogLevel};
use crate::queue::sets::WorkQueueSets;
use crate::queue::task_queue::{
    ObserverNotification, TaskQueue, TaskQueueInner, TaskQueueSpec,
};
use crate::queue::work_queue::WorkQueueKind;
use crate::task::{Nestable, Task};
use crate::time::{LazyNow, MonotonicClock, TickClock, TimeTicks};
use crate::time_domain::TimeDomain;
use crate::types::{EnqueueOrder, QueueId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

struct DeferredTask {
    queue: Arc<TaskQueueInner>,
    kind: WorkQueueKind,
    task: Task,
}

/// Main-thread-only state of the manager.
pub(crate) struct ManagerCore {
    pub(crate) queues: HashMap<QueueId, Arc<TaskQueueInner>>,
    pub(crate) sets: WorkQueueSets,
    domains: Vec<TimeDomain>,
    non_nestable_deferred: Vec<DeferredTask>,
    nesting_depth: u32,
    next_queue_id: u64,
    work_done_on_monitored_queue: bool,
}

impl ManagerCore {
    /// Re-derives one queue's selector membership from its current state.
    pub(crate) fn refresh_queue(&mut self, queue: &Arc<TaskQueueInner>) {
        let (priority, immediate_front, delayed_front) = queue.selector_state();
        let id = queue.id();
        self.sets
            .update(id, WorkQueueKind::Immediate, priority, immediate_front);
        self.sets
            .update(id, WorkQueueKind::Delayed, priority, delayed_front);
    }

    /// Removes an unregistered queue from selection and ownership.
    pub(crate) fn forget_queue(&mut self, queue: &Arc<TaskQueueInner>) {
        self.sets.remove_queue(queue.id());
        self.queues.remove(&queue.id());
    }
}

/// State shared between the main thread and posters.
pub(crate) struct ManagerShared {
    main_thread: ThreadId,
    next_order: AtomicU64,
    pub(crate) reload_flags: crate::util::AtomicFlagSet,
    controller: Arc<dyn ThreadController>,
    quit_requested: AtomicBool,
    add_queue_time_to_tasks: AtomicBool,
    log: Arc<LogCollector>,
    core: Mutex<ManagerCore>,
}

impl ManagerShared {
    pub(crate) fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    /// Allocates a fresh enqueue order. Atomic and monotonic; callers that
    /// need FIFO agreement with a queue allocate inside that queue's lock.
    pub(crate) fn allocate_enqueue_order(&self) -> EnqueueOrder {
        EnqueueOrder::from_raw(self.next_order.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn add_queue_time_to_tasks(&self) -> bool {
        self.add_queue_time_to_tasks.load(Ordering::Relaxed)
    }

    /// Wakes the main thread. Callable from any thread; never call while
    /// holding a queue lock.
    pub(crate) fn schedule_work(&self) {
        self.controller.schedule_work();
    }

    pub(crate) fn set_next_delayed_do_work(&self, run_time: Option<TimeTicks>) {
        self.controller.set_next_delayed_do_work(run_time);
    }

    /// Runs `f` with the core locked. Main thread only; `f` must not invoke
    /// user code or re-enter the manager.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut ManagerCore) -> R) -> R {
        f(&mut self.core.lock())
    }

    pub(crate) fn log_queue_unregistered(&self, name: &str, id: QueueId) {
        self.log.log(
            LogEntry::debug("task queue unregistered")
                .for_queue(id)
                .with_field("name", name),
        );
    }

    fn assert_main_thread(&self) {
        assert!(
            std::thread::current().id() == self.main_thread,
            "sequence manager used off its bound thread"
        );
    }

    /// One pass of the work loop: drain reload flags, advance time domains,
    /// select and run a single task. Returns false when no task was ready.
    fn do_work_once(self: &Arc<Self>) -> bool {
        let mut notifications: Vec<ObserverNotification> = Vec::new();
        let mut graveyard: Vec<Task> = Vec::new();

        let selected = {
            let mut core = self.core.lock();

            let mut reload_ids: SmallVec<[u64; 8]> = SmallVec::new();
            self.reload_flags.run_active(|id| reload_ids.push(id));
            for id in reload_ids {
                if let Some(queue) = core.queues.get(&QueueId(id)).cloned() {
                    queue.reload_empty_immediate_work_queue(&mut notifications);
                    core.refresh_queue(&queue);
                }
            }

            let domains = core.domains.clone();
            for domain in &domains {
                let clock = domain.clock();
                let mut lazy_now = LazyNow::new(&*clock);
                loop {
                    let Some(queue_id) = domain.next_due_queue(lazy_now.now()) else {
                        break;
                    };
                    match core.queues.get(&queue_id).cloned() {
                        Some(queue) => {
                            graveyard.extend(queue.move_ready_delayed_tasks_to_work_queue(
                                &mut lazy_now,
                                &mut notifications,
                            ));
                            core.refresh_queue(&queue);
                        }
                        None => domain.remove_queue_entry(queue_id),
                    }
                }
            }

            loop {
                let Some(selected) = core.sets.select() else {
                    let next_wake_up = core
                        .domains
                        .iter()
                        .filter_map(TimeDomain::next_scheduled_run_time)
                        .min();
                    self.controller.set_next_delayed_do_work(next_wake_up);
                    break None;
                };
                let Some(queue) = core.queues.get(&selected.queue).cloned() else {
                    // Unregistration removes a queue from the sets before it
                    // leaves the ownership map, so the selector can never
                    // hand back a forgotten queue.
                    panic!(
                        "{}",
                        Error::internal(format!(
                            "selector chose unregistered queue {}",
                            selected.queue
                        ))
                    );
                };
                let Some((task, was_blocked_or_low_priority)) = queue.take_task(selected.kind)
                else {
                    debug_assert!(
                        false,
                        "{}",
                        Error::internal(format!(
                            "work queue sets out of sync for {}",
                            selected.queue
                        ))
                    );
                    core.refresh_queue(&queue);
                    continue;
                };
                core.refresh_queue(&queue);
                if task.nestable == Nestable::NonNestable && core.nesting_depth > 1 {
                    core.non_nestable_deferred.push(DeferredTask {
                        queue,
                        kind: selected.kind,
                        task,
                    });
                    continue;
                }
                break Some((queue, task, was_blocked_or_low_priority));
            }
        };

        for (observer, wake_up) in notifications {
            observer.on_queue_next_wake_up_changed(wake_up);
        }
        drop(graveyard);

        let Some((queue, task, was_blocked_or_low_priority)) = selected else {
            return false;
        };

        let observers = queue.task_observers_snapshot();
        for observer in &observers {
            observer.will_process_task(&task, was_blocked_or_low_priority);
        }
        // The task object dies before DidProcessTask; only its callback and
        // provenance survive the destructuring.
        let (callback, posted_from) = task.into_parts();
        callback.run();
        for observer in &observers {
            observer.did_process_task(&posted_from);
        }

        if queue.should_monitor_quiescence() {
            self.core.lock().work_done_on_monitored_queue = true;
        }
        true
    }

    fn run_loop_until_idle(self: &Arc<Self>) {
        self.assert_main_thread();
        self.core.lock().nesting_depth += 1;
        loop {
            if self.quit_requested.load(Ordering::Acquire) {
                break;
            }
            if !self.do_work_once() {
                break;
            }
        }
        let mut core = self.core.lock();
        core.nesting_depth -= 1;
        // Deferred non-nestable tasks go back to the front of their original
        // work queues, newest first, so their enqueue orders stay monotonic.
        let deferred = std::mem::take(&mut core.non_nestable_deferred);
        for entry in deferred.into_iter().rev() {
            entry.queue.requeue_deferred_non_nestable(entry.task, entry.kind);
            core.refresh_queue(&entry.queue);
        }
    }
}

/// Lightweight handle to a manager, safe to capture in tasks.
#[derive(Clone)]
pub struct SequenceManagerHandle {
    shared: Weak<ManagerShared>,
}

impl SequenceManagerHandle {
    /// Wakes the manager's thread. Callable from any thread.
    pub fn schedule_work(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.schedule_work();
        }
    }

    /// Makes [`SequenceManager::run`] return at the next opportunity.
    pub fn quit(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.quit_requested.store(true, Ordering::Release);
            shared.schedule_work();
        }
    }

    /// Runs a nested loop until no task is ready. Non-nestable tasks are
    /// deferred to the outermost loop. Main thread only; typically called
    /// from within a running task.
    pub fn run_nested_until_idle(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.run_loop_until_idle();
        }
    }
}

/// Configures a [`SequenceManager`].
pub struct SequenceManagerBuilder {
    clock: Arc<dyn TickClock>,
    controller: Arc<dyn ThreadController>,
    add_queue_time_to_tasks: bool,
    log_capacity: usize,
}

impl Default for SequenceManagerBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::new()),
            controller: Arc::new(ParkingController::new()),
            add_queue_time_to_tasks: false,
            log_capacity: 256,
        }
    }
}

impl SequenceManagerBuilder {
    /// The clock backing the default time domain.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn TickClock>) -> Self {
        self.clock = clock;
        self
    }

    /// The thread controller that wakes and parks the bound thread.
    #[must_use]
    pub fn controller(mut self, controller: Arc<dyn ThreadController>) -> Self {
        self.controller = controller;
        self
    }

    /// Stamp a queue time on every posted task, not just on queues that
    /// allow delayed fences.
    #[must_use]
    pub fn add_queue_time_to_tasks(mut self, add: bool) -> Self {
        self.add_queue_time_to_tasks = add;
        self
    }

    /// Capacity of the in-memory log collector.
    #[must_use]
    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Builds the manager, binding it to the current thread.
    #[must_use]
    pub fn build(self) -> SequenceManager {
        let shared = Arc::new(ManagerShared {
            main_thread: std::thread::current().id(),
            next_order: AtomicU64::new(EnqueueOrder::FIRST.raw()),
            reload_flags: crate::util::AtomicFlagSet::new(),
            controller: self.controller,
            quit_requested: AtomicBool::new(false),
            add_queue_time_to_tasks: AtomicBool::new(self.add_queue_time_to_tasks),
            log: Arc::new(LogCollector::new(self.log_capacity).with_min_level(LogLevel::Debug)),
            core: Mutex::new(ManagerCore {
                queues: HashMap::new(),
                sets: WorkQueueSets::new(),
                domains: Vec::new(),
                non_nestable_deferred: Vec::new(),
                nesting_depth: 0,
                next_queue_id: 0,
                work_done_on_monitored_queue: false,
            }),
        });
        let default_domain = TimeDomain::new("default", self.clock);
        default_domain.bind_to_manager(&shared);
        shared.core.lock().domains.push(default_domain);
        SequenceManager { shared }
    }
}

/// The per-thread scheduling core.
///
/// Owns a set of prioritized task queues and drives their tasks on the
/// thread it was built on. Dropping the manager unregisters every queue;
/// outstanding runners keep working but reject posts.
pub struct SequenceManager {
    shared: Arc<ManagerShared>,
}

impl Default for SequenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceManager {
    /// A manager on the real monotonic clock with a parking controller.
    #[must_use]
    pub fn new() -> Self {
        SequenceManagerBuilder::default().build()
    }

    /// Starts configuring a manager.
    #[must_use]
    pub fn builder() -> SequenceManagerBuilder {
        SequenceManagerBuilder::default()
    }

    /// Creates and registers a task queue bound to the default time domain.
    #[must_use]
    pub fn create_task_queue(&self, spec: TaskQueueSpec) -> TaskQueue {
        self.shared.assert_main_thread();
        let inner = {
            let mut core = self.shared.core.lock();
            let id = QueueId(core.next_queue_id);
            core.next_queue_id += 1;
            let domain = core.domains[0].clone();
            let flag = self.shared.reload_flags.add_flag(id.value());
            let inner = TaskQueueInner::new(id, &spec, &self.shared, domain, flag);
            core.queues.insert(id, Arc::clone(&inner));
            inner
        };
        self.shared.log.log(
            LogEntry::debug("task queue created")
                .for_queue(inner.id())
                .with_field("name", inner.name()),
        );
        TaskQueue { inner }
    }

    /// The time domain queues are bound to by default.
    #[must_use]
    pub fn default_time_domain(&self) -> TimeDomain {
        self.shared.core.lock().domains[0].clone()
    }

    /// Registers an additional time domain (e.g. virtual time). Queues join
    /// it via [`TaskQueue::set_time_domain`].
    pub fn register_time_domain(&self, domain: &TimeDomain) {
        self.shared.assert_main_thread();
        domain.bind_to_manager(&self.shared);
        self.shared.core.lock().domains.push(domain.clone());
    }

    /// A cloneable handle for waking, quitting and nested runs.
    #[must_use]
    pub fn handle(&self) -> SequenceManagerHandle {
        SequenceManagerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Wakes the bound thread. Callable from any thread.
    pub fn schedule_work(&self) {
        self.shared.schedule_work();
    }

    /// Runs every ready task (including tasks they post and delayed tasks
    /// that become due meanwhile) and returns once nothing is ready.
    pub fn run_until_idle(&self) {
        self.shared.run_loop_until_idle();
    }

    /// Runs until [`SequenceManagerHandle::quit`] is called, parking in the
    /// thread controller between batches.
    pub fn run(&self) {
        self.shared.assert_main_thread();
        loop {
            self.shared.run_loop_until_idle();
            if self.shared.quit_requested.load(Ordering::Acquire) {
                break;
            }
            let clock = self.shared.core.lock().domains[0].clock();
            self.shared.controller.wait_for_work(&*clock);
        }
        self.shared.quit_requested.store(false, Ordering::Release);
    }

    /// Sweeps cancelled delayed tasks on every queue and returns unused
    /// queue capacity.
    pub fn reclaim_memory(&self) {
        self.shared.assert_main_thread();
        let (queues, now) = {
            let core = self.shared.core.lock();
            let queues: Vec<Arc<TaskQueueInner>> = core.queues.values().cloned().collect();
            (queues, core.domains[0].now())
        };
        for queue in queues {
            queue.reclaim_memory(now);
        }
    }

    /// True if no task ran on a quiescence-monitored queue since the last
    /// call. Clears the underlying bit.
    #[must_use]
    pub fn get_and_clear_system_is_quiescent_bit(&self) -> bool {
        let mut core = self.shared.core.lock();
        let quiescent = !core.work_done_on_monitored_queue;
        core.work_done_on_monitored_queue = false;
        quiescent
    }

    /// Stamp queue times on every posted task.
    pub fn set_add_queue_time_to_tasks(&self, add: bool) {
        self.shared
            .add_queue_time_to_tasks
            .store(add, Ordering::Relaxed);
    }

    /// The earliest wake-up across all time domains.
    #[must_use]
    pub fn next_scheduled_run_time(&self) -> Option<TimeTicks> {
        self.shared
            .core
            .lock()
            .domains
            .iter()
            .filter_map(TimeDomain::next_scheduled_run_time)
            .min()
    }

    /// Total pending tasks across all registered queues.
    #[must_use]
    pub fn pending_task_count(&self) -> usize {
        let queues: Vec<Arc<TaskQueueInner>> = {
            let core = self.shared.core.lock();
            core.queues.values().cloned().collect()
        };
        queues
            .iter()
            .map(|queue| queue.number_of_pending_tasks())
            .sum()
    }

    /// The manager's structured log collector. Queue lifecycle entries are
    /// tagged with their [`QueueId`] for per-queue slicing.
    #[must_use]
    pub fn log_collector(&self) -> Arc<LogCollector> {
        Arc::clone(&self.shared.log)
    }

    /// Tracing snapshot of the manager, its queues and time domains.
    #[must_use]
    pub fn as_value(&self, verbose: bool) -> Value {
        let core = self.shared.core.lock();
        let now = core.domains[0].now();
        let mut queues: Vec<&Arc<TaskQueueInner>> = core.queues.values().collect();
        queues.sort_by_key(|queue| queue.id());
        json!({
            "now_ms": now.as_millis_f64(),
            "nesting_depth": core.nesting_depth,
            "queues": queues
                .into_iter()
                .map(|queue| queue.as_value(now, verbose))
                .collect::<Vec<_>>(),
            "time_domains": core
                .domains
                .iter()
                .map(TimeDomain::as_value)
                .collect::<Vec<_>>(),
        })
    }

    fn shutdown_internal(&self) {
        let queues: Vec<Arc<TaskQueueInner>> = {
            let core = self.shared.core.lock();
            core.queues.values().cloned().collect()
        };
        for queue in queues {
            queue.unregister();
        }
        self.shared.log.log(LogEntry::info("sequence manager shut down"));
    }
}

impl Drop for SequenceManager {
    fn drop(&mut self) {
        self.shutdown_internal();
    }
}

impl std::fmt::Debug for SequenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("SequenceManager")
            .field("queues", &core.queues.len())
            .field("nesting_depth", &core.nesting_depth)
            .finish_non_exhaustive()
    }
}
