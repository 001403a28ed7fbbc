//! The user-visible task queue.
//!
//! A [`TaskQueue`] owns two work queues (immediate and delayed), a
//! cross-thread staging deque, a delayed-task heap, a fence slot and a
//! priority. State is partitioned into two substructures: `AnyThread`,
//! guarded by a per-queue lock and touched by posters on arbitrary threads,
//! and `MainThreadOnly`, touched exclusively by the thread the sequence
//! manager is bound to.
//!
//! Cross-thread posting takes only the queue's own lock; the enqueue order is
//! allocated inside that lock so FIFO order on the staging deque matches
//! enqueue-order order. Waking the main thread happens after the lock is
//! released.

use crate::error::{Error, ErrorKind, Result};
use crate::manager::ManagerShared;
use crate::queue::delayed_incoming::DelayedIncomingQueue;
use crate::queue::work_queue::{WorkQueue, WorkQueueKind};
use crate::runner::{GuardedTaskPoster, TaskRunner};
use crate::task::{Callback, Location, Nestable, PostedTask, Task, TaskType};
use crate::time::{LazyNow, TickClock, TimeTicks, WakeUp, WakeUpResolution, HIGH_RESOLUTION_THRESHOLD};
use crate::time_domain::TimeDomain;
use crate::types::{EnqueueOrder, QueueId, QueuePriority};
use parking_lot::Mutex;
use serde_json::{json, Value};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

/// Where to place a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFencePosition {
    /// Fence at a freshly allocated enqueue order: blocks only tasks posted
    /// strictly after this call.
    Now,
    /// Fence below every real enqueue order: blocks the queue entirely.
    BeginningOfTime,
}

/// Per-task observer callbacks, run on the main thread with no locks held.
pub trait TaskObserver: Send + Sync {
    /// Called before the task's callback runs. `was_blocked_or_low_priority`
    /// is true when the task spent its whole queued life blocked by a fence,
    /// disabled, or below normal priority.
    fn will_process_task(&self, task: &Task, was_blocked_or_low_priority: bool);
    /// Called after the task has run and been destroyed.
    fn did_process_task(&self, posted_from: &Location);
}

/// Queue-level observer, notified when the queue's next wake-up changes.
pub trait QueueObserver: Send + Sync {
    /// `wake_up` is the new next wake-up time, or `None` when the queue has
    /// immediate work (or no delayed work at all).
    fn on_queue_next_wake_up_changed(&self, wake_up: Option<TimeTicks>);
}

/// Hook invoked under the any-thread lock for every accepted post.
pub type OnTaskPostedHandler = Arc<dyn Fn(&Task) + Send + Sync>;

pub(crate) type ObserverNotification = (Arc<dyn QueueObserver>, Option<TimeTicks>);

/// Construction options for a task queue.
#[derive(Debug, Clone)]
pub struct TaskQueueSpec {
    pub(crate) name: String,
    pub(crate) should_monitor_quiescence: bool,
    pub(crate) should_notify_observers: bool,
    pub(crate) delayed_fence_allowed: bool,
}

impl TaskQueueSpec {
    /// A spec with defaults: observers notified, no quiescence monitoring,
    /// delayed fences disallowed.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            should_monitor_quiescence: false,
            should_notify_observers: true,
            delayed_fence_allowed: false,
        }
    }

    /// Queue participates in idle detection.
    #[must_use]
    pub fn with_monitored_quiescence(mut self) -> Self {
        self.should_monitor_quiescence = true;
        self
    }

    /// Skip per-task observer callbacks for this queue.
    #[must_use]
    pub fn without_observer_notifications(mut self) -> Self {
        self.should_notify_observers = false;
        self
    }

    /// Allow [`TaskQueue::insert_fence_at`]. Opting in makes every immediate
    /// post capture a queue time.
    #[must_use]
    pub fn with_delayed_fence_allowed(mut self) -> Self {
        self.delayed_fence_allowed = true;
        self
    }
}

/// State posters may touch from any thread, guarded by the queue lock.
pub(crate) struct AnyThread {
    pub(crate) immediate_incoming_queue: VecDeque<Task>,
    /// Dropped at unregistration; a `None` here rejects all posts.
    pub(crate) manager: Option<Arc<ManagerShared>>,
    /// The owning time domain's clock, for cross-thread "now" reads.
    pub(crate) clock: Option<Arc<dyn TickClock>>,
    pub(crate) unregistered: bool,
    /// Mirror of `MainThreadOnly::immediate_work_queue.is_empty()`.
    pub(crate) immediate_work_queue_empty: bool,
    /// Cached decision: should an accepted immediate post wake the main
    /// thread. True iff the queue is enabled and either has a wake-up
    /// observer or no current fence.
    pub(crate) post_immediate_task_should_schedule_work: bool,
    pub(crate) on_task_posted: Option<OnTaskPostedHandler>,
    pub(crate) reload_flag: Option<crate::util::AtomicFlag>,
}

/// State touched only by the thread the manager is bound to.
pub(crate) struct MainThreadOnly {
    pub(crate) immediate_work_queue: WorkQueue,
    pub(crate) delayed_work_queue: WorkQueue,
    pub(crate) delayed_incoming_queue: DelayedIncomingQueue,
    pub(crate) time_domain: Option<TimeDomain>,
    pub(crate) current_fence: EnqueueOrder,
    /// Deadline at which a `Now` fence auto-installs.
    pub(crate) delayed_fence: Option<TimeTicks>,
    pub(crate) is_enabled: bool,
    pub(crate) disabled_time: Option<TimeTicks>,
    pub(crate) priority: QueuePriority,
    pub(crate) scheduled_wake_up: Option<WakeUp>,
    pub(crate) observer: Option<Arc<dyn QueueObserver>>,
    pub(crate) task_observers: SmallVec<[Arc<dyn TaskObserver>; 2]>,
    /// Enqueue order allocated when the queue last became unblocked.
    pub(crate) unblocked_order: EnqueueOrder,
    /// Enqueue order allocated when the queue last became unblocked while at
    /// normal or higher priority; `MAX` while below normal priority.
    pub(crate) unblocked_with_normal_priority_order: EnqueueOrder,
}

pub(crate) struct TaskQueueInner {
    name: String,
    id: QueueId,
    should_monitor_quiescence: bool,
    should_notify_observers: bool,
    delayed_fence_allowed: bool,
    main_thread: ThreadId,
    manager: Weak<ManagerShared>,
    self_weak: Weak<TaskQueueInner>,
    pub(crate) poster: Arc<GuardedTaskPoster>,
    pub(crate) any_thread: Mutex<AnyThread>,
    pub(crate) main: Mutex<MainThreadOnly>,
}

impl TaskQueueInner {
    pub(crate) fn new(
        id: QueueId,
        spec: &TaskQueueSpec,
        manager: &Arc<ManagerShared>,
        time_domain: TimeDomain,
        reload_flag: crate::util::AtomicFlag,
    ) -> Arc<Self> {
        let inner = Arc::new_cyclic(|weak: &Weak<TaskQueueInner>| {
            let poster = Arc::new(GuardedTaskPoster::new(weak.clone()));
            TaskQueueInner {
                name: spec.name.clone(),
                id,
                should_monitor_quiescence: spec.should_monitor_quiescence,
                should_notify_observers: spec.should_notify_observers,
                delayed_fence_allowed: spec.delayed_fence_allowed,
                main_thread: manager.main_thread(),
                manager: Arc::downgrade(manager),
                self_weak: weak.clone(),
                poster,
                any_thread: Mutex::new(AnyThread {
                    immediate_incoming_queue: VecDeque::new(),
                    manager: Some(Arc::clone(manager)),
                    clock: Some(time_domain.clock()),
                    unregistered: false,
                    immediate_work_queue_empty: true,
                    post_immediate_task_should_schedule_work: true,
                    on_task_posted: None,
                    reload_flag: Some(reload_flag),
                }),
                main: Mutex::new(MainThreadOnly {
                    immediate_work_queue: WorkQueue::new(WorkQueueKind::Immediate),
                    delayed_work_queue: WorkQueue::new(WorkQueueKind::Delayed),
                    delayed_incoming_queue: DelayedIncomingQueue::new(),
                    time_domain: Some(time_domain),
                    current_fence: EnqueueOrder::NONE,
                    delayed_fence: None,
                    is_enabled: true,
                    disabled_time: None,
                    priority: QueuePriority::Normal,
                    scheduled_wake_up: None,
                    observer: None,
                    task_observers: SmallVec::new(),
                    unblocked_order: EnqueueOrder::NONE,
                    unblocked_with_normal_priority_order: EnqueueOrder::NONE,
                }),
            }
        });
        inner.poster.start_accepting_operations();
        inner
    }

    pub(crate) fn id(&self) -> QueueId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn should_monitor_quiescence(&self) -> bool {
        self.should_monitor_quiescence
    }

    fn assert_main_thread(&self) {
        assert!(
            std::thread::current().id() == self.main_thread,
            "task queue '{}' used off its owning thread",
            self.name
        );
    }

    // ---- posting -----------------------------------------------------------

    pub(crate) fn post_task(&self, posted: PostedTask) -> Result<()> {
        if posted.delay.is_zero() {
            self.post_immediate_task_impl(posted)
        } else {
            self.post_delayed_task_impl(posted)
        }
    }

    fn post_immediate_task_impl(&self, mut posted: PostedTask) -> Result<()> {
        let mut wake_manager = None;
        {
            let mut any = self.any_thread.lock();
            let Some(manager) = any.manager.clone() else {
                return Err(Error::new(ErrorKind::QueueUnregistered));
            };
            if posted.queue_time.is_none()
                && (manager.add_queue_time_to_tasks() || self.delayed_fence_allowed)
            {
                let clock = any.clock.clone().expect("registered queue has a clock");
                posted.queue_time = Some(clock.now_ticks());
            }

            // The enqueue order is allocated inside the lock so that FIFO
            // order on the staging deque matches enqueue-order order even
            // with several posting threads.
            let order = manager.allocate_enqueue_order();
            let was_incoming_empty = any.immediate_incoming_queue.is_empty();
            let task = Task::new(posted, None, order.raw(), order, false);
            if let Some(hook) = any.on_task_posted.clone() {
                hook(&task);
            }
            any.immediate_incoming_queue.push_back(task);

            if was_incoming_empty && any.immediate_work_queue_empty {
                if let Some(flag) = &any.reload_flag {
                    flag.set_active(true);
                }
                if any.post_immediate_task_should_schedule_work {
                    wake_manager = Some(manager);
                }
            }
        }

        // Waking the main thread may take a platform lock; doing it outside
        // the queue lock avoids priority inversion against other posters.
        if let Some(manager) = wake_manager {
            manager.schedule_work();
        }
        Ok(())
    }

    fn post_delayed_task_impl(&self, mut posted: PostedTask) -> Result<()> {
        debug_assert!(!posted.delay.is_zero());
        let is_high_res = posted.delay < HIGH_RESOLUTION_THRESHOLD;

        if std::thread::current().id() == self.main_thread {
            let (manager, now) = {
                let any = self.any_thread.lock();
                let Some(manager) = any.manager.clone() else {
                    return Err(Error::new(ErrorKind::QueueUnregistered));
                };
                let clock = any.clock.clone().expect("registered queue has a clock");
                (manager, clock.now_ticks())
            };
            let sequence_number = manager.allocate_enqueue_order();
            let delayed_run_time = now.saturating_add(posted.delay);
            if manager.add_queue_time_to_tasks() {
                posted.queue_time = Some(now);
            }
            let task = Task::new(
                posted,
                Some(delayed_run_time),
                sequence_number.raw(),
                EnqueueOrder::NONE,
                is_high_res,
            );
            let mut notifications = Vec::new();
            {
                let mut main = self.main.lock();
                self.push_onto_delayed_incoming_queue_from_main_thread(
                    &mut main,
                    task,
                    now,
                    &mut notifications,
                );
            }
            deliver(notifications);
            Ok(())
        } else {
            // Posting a delayed task from another thread is not the hot
            // path: it costs an extra main-thread hop that re-routes the
            // carried task through the delayed incoming queue.
            let (manager, now) = {
                let any = self.any_thread.lock();
                let Some(manager) = any.manager.clone() else {
                    return Err(Error::new(ErrorKind::QueueUnregistered));
                };
                let clock = any.clock.clone().expect("registered queue has a clock");
                (manager, clock.now_ticks())
            };
            let sequence_number = manager.allocate_enqueue_order();
            let delayed_run_time = now.saturating_add(posted.delay);
            if manager.add_queue_time_to_tasks() {
                posted.queue_time = Some(now);
            }
            let task_type = posted.task_type;
            let task = Task::new(
                posted,
                Some(delayed_run_time),
                sequence_number.raw(),
                EnqueueOrder::NONE,
                is_high_res,
            );
            let this = self.self_weak.upgrade().expect("queue inner is alive");
            let mut helper = PostedTask::new(
                Location::caller(),
                Callback::new(move || this.schedule_delayed_work_task(task)),
            );
            helper.nestable = Nestable::NonNestable;
            helper.task_type = task_type;
            self.post_immediate_task_impl(helper)
        }
    }

    fn push_onto_delayed_incoming_queue_from_main_thread(
        &self,
        main: &mut MainThreadOnly,
        task: Task,
        now: TimeTicks,
        notifications: &mut Vec<ObserverNotification>,
    ) {
        main.delayed_incoming_queue.push(task);
        let Some(domain) = main.time_domain.clone() else {
            return;
        };
        let clock = domain.clock();
        let mut lazy_now = LazyNow::with_now(&*clock, now);
        self.update_delayed_wake_up(main, &mut lazy_now, notifications);
    }

    /// Runs on the main thread as the body of the cross-thread helper task.
    fn schedule_delayed_work_task(&self, mut task: Task) {
        self.assert_main_thread();
        let delayed_run_time = task.delayed_run_time.expect("carried task is delayed");
        let mut notifications = Vec::new();
        let mut graveyard = Vec::new();
        {
            let mut main = self.main.lock();
            let Some(domain) = main.time_domain.clone() else {
                return;
            };
            let now = domain.now();
            if delayed_run_time <= now {
                // The deadline passed in transit. Route through the delayed
                // incoming queue anyway so the task is ordered like any other
                // due delayed task, then promote it right away.
                task.delayed_run_time = Some(now);
                main.delayed_incoming_queue.push(task);
                let clock = domain.clock();
                let mut lazy_now = LazyNow::with_now(&*clock, now);
                graveyard =
                    self.move_ready_delayed_tasks_locked(&mut main, &mut lazy_now, &mut notifications);
            } else {
                self.push_onto_delayed_incoming_queue_from_main_thread(
                    &mut main,
                    task,
                    now,
                    &mut notifications,
                );
            }
        }
        self.sync_with_selector();
        deliver(notifications);
        drop(graveyard);
    }

    // ---- reload & promotion ------------------------------------------------

    /// Drains the staging deque into the immediate work queue. Called by the
    /// manager when this queue's reload flag was set.
    pub(crate) fn reload_empty_immediate_work_queue(
        &self,
        notifications: &mut Vec<ObserverNotification>,
    ) {
        let mut main = self.main.lock();
        debug_assert!(main.immediate_work_queue.is_empty());

        let mut any = self.any_thread.lock();
        Self::take_immediate_incoming_queue_tasks(&mut main, &mut any);
        drop(any);

        if main.is_enabled {
            if let Some(observer) = main.observer.clone() {
                notifications.push((observer, None));
            }
        }
    }

    /// Moves everything staged by posters into the immediate work queue,
    /// firing a pending delayed fence on the first task whose queue time
    /// crossed the deadline. The enqueue order had to be minted on the
    /// posting thread, so the fence check happens here rather than at post
    /// time.
    fn take_immediate_incoming_queue_tasks(main: &mut MainThreadOnly, any: &mut AnyThread) {
        let incoming = std::mem::take(&mut any.immediate_incoming_queue);

        if let Some(deadline) = main.delayed_fence {
            for task in &incoming {
                debug_assert!(task.queue_time.is_some());
                if task.queue_time.is_some_and(|t| t >= deadline) {
                    main.delayed_fence = None;
                    debug_assert!(!main.current_fence.is_set());
                    main.current_fence = task.enqueue_order();
                    main.immediate_work_queue
                        .insert_fence_silently(main.current_fence);
                    main.delayed_work_queue
                        .insert_fence_silently(main.current_fence);
                    break;
                }
            }
        }

        main.immediate_work_queue.append(incoming);
        // Everything staged has been taken; a pending reload is moot.
        if let Some(flag) = &any.reload_flag {
            flag.set_active(false);
        }
        Self::update_cross_thread_queue_state(main, any);
    }

    /// Promotes every due delayed task into the delayed work queue. Returns
    /// cancelled tasks popped along the way; the caller drops them outside
    /// all locks.
    pub(crate) fn move_ready_delayed_tasks_to_work_queue(
        &self,
        lazy_now: &mut LazyNow<'_>,
        notifications: &mut Vec<ObserverNotification>,
    ) -> Vec<Task> {
        let mut main = self.main.lock();
        self.move_ready_delayed_tasks_locked(&mut main, lazy_now, notifications)
    }

    fn move_ready_delayed_tasks_locked(
        &self,
        main: &mut MainThreadOnly,
        lazy_now: &mut LazyNow<'_>,
        notifications: &mut Vec<ObserverNotification>,
    ) -> Vec<Task> {
        let Some(manager) = self.manager.upgrade() else {
            return Vec::new();
        };
        let mut cancelled = Vec::new();
        while let Some(front) = main.delayed_incoming_queue.peek() {
            if front.is_cancelled() {
                cancelled.push(main.delayed_incoming_queue.pop().expect("peeked"));
                continue;
            }
            let delayed_run_time = front.delayed_run_time.expect("delayed task has run time");
            if delayed_run_time > lazy_now.now() {
                break;
            }
            self.activate_delayed_fence_if_needed(main, delayed_run_time, &manager);
            let mut task = main.delayed_incoming_queue.pop().expect("peeked");
            debug_assert!(!task.enqueue_order_set());
            task.set_enqueue_order(manager.allocate_enqueue_order());
            main.delayed_work_queue.push(task);
        }
        self.update_delayed_wake_up(main, lazy_now, notifications);
        cancelled
    }

    fn activate_delayed_fence_if_needed(
        &self,
        main: &mut MainThreadOnly,
        run_time: TimeTicks,
        manager: &Arc<ManagerShared>,
    ) {
        let Some(deadline) = main.delayed_fence else {
            return;
        };
        if deadline > run_time {
            return;
        }
        // The fence takes an order below the task that crossed the deadline,
        // so that task itself is blocked.
        main.delayed_fence = None;
        main.current_fence = manager.allocate_enqueue_order();
        main.immediate_work_queue
            .insert_fence_silently(main.current_fence);
        main.delayed_work_queue
            .insert_fence_silently(main.current_fence);
        let mut any = self.any_thread.lock();
        Self::update_cross_thread_queue_state(main, &mut any);
    }

    // ---- wake-ups ----------------------------------------------------------

    fn get_next_scheduled_wake_up_impl(&self, main: &MainThreadOnly) -> Option<WakeUp> {
        if !main.is_enabled {
            return None;
        }
        let top = main.delayed_incoming_queue.peek()?;
        // Precise wake-ups are pointless for queues below normal priority.
        let resolution = if main.delayed_incoming_queue.has_pending_high_res_tasks()
            && main.priority.is_normal_or_more_important()
        {
            WakeUpResolution::High
        } else {
            WakeUpResolution::Low
        };
        Some(WakeUp {
            time: top.delayed_run_time.expect("delayed task has run time"),
            resolution,
        })
    }

    fn update_delayed_wake_up(
        &self,
        main: &mut MainThreadOnly,
        lazy_now: &mut LazyNow<'_>,
        notifications: &mut Vec<ObserverNotification>,
    ) {
        let wake_up = self.get_next_scheduled_wake_up_impl(main);
        if main.scheduled_wake_up == wake_up {
            return;
        }
        main.scheduled_wake_up = wake_up;

        if let (Some(wake_up), Some(observer)) = (wake_up, main.observer.clone()) {
            if !self.has_pending_immediate_work_main(main) {
                notifications.push((observer, Some(wake_up.time)));
            }
        }

        if let Some(domain) = main.time_domain.clone() {
            domain.set_next_wake_up_for_queue(self.id, wake_up, lazy_now);
        }
    }

    fn has_pending_immediate_work_main(&self, main: &MainThreadOnly) -> bool {
        if !main.delayed_work_queue.is_empty() || !main.immediate_work_queue.is_empty() {
            return true;
        }
        !self.any_thread.lock().immediate_incoming_queue.is_empty()
    }

    // ---- selection support -------------------------------------------------

    /// The selector keys for both work queues: priority band plus the front
    /// enqueue order of each eligible work queue.
    pub(crate) fn selector_state(
        &self,
    ) -> (QueuePriority, Option<EnqueueOrder>, Option<EnqueueOrder>) {
        let main = self.main.lock();
        let eligible = |wq: &WorkQueue| -> Option<EnqueueOrder> {
            if !main.is_enabled || wq.blocked_by_fence() {
                return None;
            }
            wq.front_task_order()
        };
        (
            main.priority,
            eligible(&main.immediate_work_queue),
            eligible(&main.delayed_work_queue),
        )
    }

    /// Pops the front task of the given work queue. Returns the task and
    /// whether it spent its queued life blocked or below normal priority.
    ///
    /// When the immediate work queue runs dry it refills from the staging
    /// deque on the spot: posts that arrived against a non-empty work queue
    /// never set the reload flag, so this is their only way in.
    pub(crate) fn take_task(&self, kind: WorkQueueKind) -> Option<(Task, bool)> {
        let mut main = self.main.lock();
        let task = match kind {
            WorkQueueKind::Immediate => main.immediate_work_queue.take_front()?,
            WorkQueueKind::Delayed => main.delayed_work_queue.take_front()?,
        };
        if kind == WorkQueueKind::Immediate && main.immediate_work_queue.is_empty() {
            let mut any = self.any_thread.lock();
            Self::take_immediate_incoming_queue_tasks(&mut main, &mut any);
        }
        let was_blocked_or_low_priority =
            task.enqueue_order() < main.unblocked_with_normal_priority_order;
        Some((task, was_blocked_or_low_priority))
    }

    /// Puts a deferred non-nestable task back at the front of its original
    /// work queue, keeping its original enqueue order.
    pub(crate) fn requeue_deferred_non_nestable(&self, task: Task, kind: WorkQueueKind) {
        debug_assert!(task.nestable == Nestable::NonNestable);
        let mut main = self.main.lock();
        match kind {
            WorkQueueKind::Delayed => main.delayed_work_queue.push_non_nestable_task_to_front(task),
            WorkQueueKind::Immediate => {
                // The task bypasses the staging deque, so a reload scheduled
                // for this queue must be cancelled while the lock is held or
                // a racing post could re-set it against a non-empty queue.
                if main.immediate_work_queue.is_empty() {
                    let mut any = self.any_thread.lock();
                    if let Some(flag) = &any.reload_flag {
                        flag.set_active(false);
                    }
                    any.immediate_work_queue_empty = false;
                    main.immediate_work_queue.push_non_nestable_task_to_front(task);
                } else {
                    main.immediate_work_queue.push_non_nestable_task_to_front(task);
                }
            }
        }
    }

    pub(crate) fn task_observers_snapshot(&self) -> SmallVec<[Arc<dyn TaskObserver>; 2]> {
        if !self.should_notify_observers {
            return SmallVec::new();
        }
        self.main.lock().task_observers.clone()
    }

    // ---- cross-thread state ------------------------------------------------

    fn update_cross_thread_queue_state(main: &MainThreadOnly, any: &mut AnyThread) {
        any.immediate_work_queue_empty = main.immediate_work_queue.is_empty();
        any.post_immediate_task_should_schedule_work = if main.observer.is_some() {
            // The reload pass must run to issue the observer callback, so a
            // wake is needed even while fenced.
            main.is_enabled
        } else {
            main.is_enabled && !main.current_fence.is_set()
        };
    }

    fn on_queue_unblocked(&self, main: &mut MainThreadOnly, manager: &Arc<ManagerShared>) {
        debug_assert!(main.is_enabled);
        main.unblocked_order = manager.allocate_enqueue_order();
        if main.priority.is_normal_or_more_important() {
            main.unblocked_with_normal_priority_order = main.unblocked_order;
        }
    }

    /// Re-derives this queue's selector membership. Called from queue methods
    /// that run outside the manager's work loop.
    fn sync_with_selector(&self) {
        if let Some(manager) = self.manager.upgrade() {
            let this = self.self_weak.upgrade().expect("queue inner is alive");
            manager.with_core(move |core| core.refresh_queue(&this));
        }
    }

    // ---- fences ------------------------------------------------------------

    pub(crate) fn insert_fence(&self, position: InsertFencePosition) {
        self.assert_main_thread();
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut unblocked;
        let enabled;
        {
            let mut main = self.main.lock();
            // Only one fence, delayed or not, may exist at a time.
            main.delayed_fence = None;
            let previous_fence = main.current_fence;
            let fence = match position {
                InsertFencePosition::Now => manager.allocate_enqueue_order(),
                InsertFencePosition::BeginningOfTime => EnqueueOrder::BLOCKING_FENCE,
            };
            main.current_fence = fence;
            unblocked = main.immediate_work_queue.insert_fence(fence);
            unblocked |= main.delayed_work_queue.insert_fence(fence);

            {
                let mut any = self.any_thread.lock();
                if !unblocked && previous_fence.is_set() && previous_fence < fence {
                    if let Some(front) = any.immediate_incoming_queue.front() {
                        let order = front.enqueue_order();
                        if order > previous_fence && order < fence {
                            unblocked = true;
                        }
                    }
                }
                Self::update_cross_thread_queue_state(&main, &mut any);
            }

            enabled = main.is_enabled;
            if enabled && unblocked {
                self.on_queue_unblocked(&mut main, &manager);
            }
        }
        self.sync_with_selector();
        if enabled && unblocked {
            manager.schedule_work();
        }
    }

    pub(crate) fn insert_fence_at(&self, time: TimeTicks) {
        self.assert_main_thread();
        assert!(
            self.delayed_fence_allowed,
            "delayed fences are not allowed for task queue '{}'; opt in via TaskQueueSpec",
            self.name
        );
        // A queue can have only one fence, delayed or not.
        self.remove_fence();
        self.main.lock().delayed_fence = Some(time);
    }

    pub(crate) fn remove_fence(&self) {
        self.assert_main_thread();
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut unblocked;
        let enabled;
        {
            let mut main = self.main.lock();
            let previous_fence = main.current_fence;
            main.current_fence = EnqueueOrder::NONE;
            main.delayed_fence = None;

            unblocked = main.immediate_work_queue.remove_fence();
            unblocked |= main.delayed_work_queue.remove_fence();

            {
                let mut any = self.any_thread.lock();
                if !unblocked && previous_fence.is_set() {
                    if let Some(front) = any.immediate_incoming_queue.front() {
                        if front.enqueue_order() > previous_fence {
                            unblocked = true;
                        }
                    }
                }
                Self::update_cross_thread_queue_state(&main, &mut any);
            }

            enabled = main.is_enabled;
            if enabled && unblocked {
                self.on_queue_unblocked(&mut main, &manager);
            }
        }
        self.sync_with_selector();
        if enabled && unblocked {
            manager.schedule_work();
        }
    }

    pub(crate) fn has_active_fence(&self) -> bool {
        let main = self.main.lock();
        if let (Some(deadline), Some(domain)) = (main.delayed_fence, main.time_domain.clone()) {
            if domain.now() > deadline {
                return true;
            }
        }
        main.current_fence.is_set()
    }

    pub(crate) fn blocked_by_fence(&self) -> bool {
        let main = self.main.lock();
        if !main.current_fence.is_set() {
            return false;
        }
        if !main.immediate_work_queue.blocked_by_fence()
            || !main.delayed_work_queue.blocked_by_fence()
        {
            return false;
        }
        let any = self.any_thread.lock();
        match any.immediate_incoming_queue.front() {
            None => true,
            Some(front) => front.enqueue_order() > main.current_fence,
        }
    }

    // ---- enabling ----------------------------------------------------------

    pub(crate) fn set_queue_enabled(&self, enabled: bool) {
        self.assert_main_thread();
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut notifications = Vec::new();
        let mut should_schedule_work = false;
        {
            let mut main = self.main.lock();
            if main.is_enabled == enabled {
                return;
            }
            main.is_enabled = enabled;
            let Some(domain) = main.time_domain.clone() else {
                return;
            };
            main.disabled_time = if enabled { None } else { Some(domain.now()) };

            let clock = domain.clock();
            let mut lazy_now = LazyNow::new(&*clock);
            self.update_delayed_wake_up(&mut main, &mut lazy_now, &mut notifications);

            let has_pending_immediate_work;
            {
                let mut any = self.any_thread.lock();
                Self::update_cross_thread_queue_state(&main, &mut any);
                has_pending_immediate_work = !main.delayed_work_queue.is_empty()
                    || !main.immediate_work_queue.is_empty()
                    || !any.immediate_incoming_queue.is_empty();
            }

            if enabled {
                if has_pending_immediate_work {
                    if let Some(observer) = main.observer.clone() {
                        // Delayed-work notification is issued via the time
                        // domain above.
                        notifications.push((observer, None));
                    }
                }
                let fence_blocked = main.current_fence.is_set()
                    && main.immediate_work_queue.blocked_by_fence()
                    && main.delayed_work_queue.blocked_by_fence();
                if !fence_blocked {
                    self.on_queue_unblocked(&mut main, &manager);
                }
                should_schedule_work = true;
            }
        }
        self.sync_with_selector();
        deliver(notifications);
        if should_schedule_work {
            manager.schedule_work();
        }
    }

    pub(crate) fn is_queue_enabled(&self) -> bool {
        self.main.lock().is_enabled
    }

    // ---- priority ----------------------------------------------------------

    pub(crate) fn set_queue_priority(&self, priority: QueuePriority) {
        self.assert_main_thread();
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut notifications = Vec::new();
        {
            let mut main = self.main.lock();
            let previous = main.priority;
            if previous == priority {
                return;
            }
            main.priority = priority;

            if !priority.is_normal_or_more_important() {
                // Tasks that run while the queue sits below normal priority
                // count as "was low priority" for observers.
                main.unblocked_with_normal_priority_order = EnqueueOrder::MAX;
            } else if !previous.is_normal_or_more_important() {
                main.unblocked_with_normal_priority_order = manager.allocate_enqueue_order();
            }

            // The wake-up resolution depends on the priority band.
            if let Some(domain) = main.time_domain.clone() {
                let clock = domain.clock();
                let mut lazy_now = LazyNow::new(&*clock);
                self.update_delayed_wake_up(&mut main, &mut lazy_now, &mut notifications);
            }
        }
        self.sync_with_selector();
        deliver(notifications);
    }

    pub(crate) fn queue_priority(&self) -> QueuePriority {
        self.main.lock().priority
    }

    // ---- time domains ------------------------------------------------------

    pub(crate) fn set_time_domain(&self, time_domain: TimeDomain) {
        self.assert_main_thread();
        {
            let mut any = self.any_thread.lock();
            if any.unregistered {
                return;
            }
            any.clock = Some(time_domain.clock());
        }
        let mut notifications = Vec::new();
        {
            let mut main = self.main.lock();
            if let Some(old) = main.time_domain.clone() {
                if old.ptr_eq(&time_domain) {
                    return;
                }
                let clock = old.clock();
                let mut lazy_now = LazyNow::new(&*clock);
                old.set_next_wake_up_for_queue(self.id, None, &mut lazy_now);
            }
            main.time_domain = Some(time_domain.clone());
            // Force re-notification under the new domain.
            main.scheduled_wake_up = None;
            let clock = time_domain.clock();
            let mut lazy_now = LazyNow::new(&*clock);
            self.update_delayed_wake_up(&mut main, &mut lazy_now, &mut notifications);
        }
        deliver(notifications);
    }

    pub(crate) fn time_domain(&self) -> Option<TimeDomain> {
        self.main.lock().time_domain.clone()
    }

    // ---- introspection -----------------------------------------------------

    pub(crate) fn is_empty(&self) -> bool {
        let main = self.main.lock();
        if !main.delayed_work_queue.is_empty()
            || !main.delayed_incoming_queue.is_empty()
            || !main.immediate_work_queue.is_empty()
        {
            return false;
        }
        self.any_thread.lock().immediate_incoming_queue.is_empty()
    }

    pub(crate) fn number_of_pending_tasks(&self) -> usize {
        let main = self.main.lock();
        let mut count = main.delayed_work_queue.len()
            + main.delayed_incoming_queue.len()
            + main.immediate_work_queue.len();
        count += self.any_thread.lock().immediate_incoming_queue.len();
        count
    }

    pub(crate) fn has_task_to_run_immediately(&self) -> bool {
        let main = self.main.lock();
        if (!main.immediate_work_queue.is_empty() && !main.immediate_work_queue.blocked_by_fence())
            || (!main.delayed_work_queue.is_empty() && !main.delayed_work_queue.blocked_by_fence())
        {
            return true;
        }
        // A due delayed task would be committed above any current fence, so
        // it only counts while no fence is installed.
        if !main.current_fence.is_set() {
            if let (Some(front), Some(domain)) =
                (main.delayed_incoming_queue.peek(), main.time_domain.clone())
            {
                let due = front
                    .delayed_run_time
                    .is_some_and(|run_time| run_time <= domain.now());
                if due {
                    return true;
                }
            }
        }
        let any = self.any_thread.lock();
        match any.immediate_incoming_queue.front() {
            None => false,
            Some(front) => {
                !main.current_fence.is_set() || front.enqueue_order() < main.current_fence
            }
        }
    }

    pub(crate) fn pending_high_resolution_task_count(&self) -> usize {
        self.main.lock().delayed_incoming_queue.pending_high_res_count()
    }

    pub(crate) fn is_unregistered(&self) -> bool {
        self.any_thread.lock().unregistered
    }

    pub(crate) fn was_blocked_or_low_priority(&self, order: EnqueueOrder) -> bool {
        order < self.main.lock().unblocked_with_normal_priority_order
    }

    // ---- observers ---------------------------------------------------------

    pub(crate) fn add_task_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.assert_main_thread();
        self.main.lock().task_observers.push(observer);
    }

    pub(crate) fn remove_task_observer(&self, observer: &Arc<dyn TaskObserver>) {
        self.assert_main_thread();
        self.main
            .lock()
            .task_observers
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    pub(crate) fn set_observer(&self, observer: Option<Arc<dyn QueueObserver>>) {
        self.assert_main_thread();
        let mut main = self.main.lock();
        if observer.is_some() {
            assert!(
                main.observer.is_none(),
                "task queue '{}' already has an observer",
                self.name
            );
        }
        main.observer = observer;
        let mut any = self.any_thread.lock();
        Self::update_cross_thread_queue_state(&main, &mut any);
    }

    pub(crate) fn set_on_task_posted_handler(&self, handler: Option<OnTaskPostedHandler>) {
        let mut any = self.any_thread.lock();
        any.on_task_posted = handler;
    }

    // ---- memory ------------------------------------------------------------

    pub(crate) fn reclaim_memory(&self, now: TimeTicks) {
        self.assert_main_thread();
        let mut notifications = Vec::new();
        let removed;
        {
            let mut main = self.main.lock();
            removed = main.delayed_incoming_queue.sweep_cancelled_tasks();
            main.delayed_work_queue.maybe_shrink();
            main.immediate_work_queue.maybe_shrink();
            {
                let mut any = self.any_thread.lock();
                any.immediate_incoming_queue.shrink_to_fit();
            }
            if let Some(domain) = main.time_domain.clone() {
                let clock = domain.clock();
                let mut lazy_now = LazyNow::with_now(&*clock, now);
                self.update_delayed_wake_up(&mut main, &mut lazy_now, &mut notifications);
            }
        }
        deliver(notifications);
        drop(removed);
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Detaches the queue from its manager: rejects future posts, waits for
    /// in-flight posts, and empties every queue. Task destruction happens
    /// outside all locks because a dying task may itself reference this
    /// queue.
    pub(crate) fn unregister(&self) {
        self.assert_main_thread();
        self.poster.shutdown_and_drain_operations();

        let (incoming, reload_flag) = {
            let mut any = self.any_thread.lock();
            any.unregistered = true;
            any.manager = None;
            any.clock = None;
            any.on_task_posted = None;
            (
                std::mem::take(&mut any.immediate_incoming_queue),
                any.reload_flag.take(),
            )
        };
        drop(reload_flag);

        if let Some(manager) = self.manager.upgrade() {
            let this = self.self_weak.upgrade().expect("queue inner is alive");
            manager.with_core(move |core| core.forget_queue(&this));
            manager.log_queue_unregistered(&self.name, self.id);
        }

        let (immediate, delayed, delayed_incoming) = {
            let mut main = self.main.lock();
            if let Some(domain) = main.time_domain.take() {
                let clock = domain.clock();
                let mut lazy_now = LazyNow::new(&*clock);
                domain.set_next_wake_up_for_queue(self.id, None, &mut lazy_now);
            }
            main.observer = None;
            main.task_observers.clear();
            main.scheduled_wake_up = None;
            (
                main.immediate_work_queue.take_all(),
                main.delayed_work_queue.take_all(),
                main.delayed_incoming_queue.take_all(),
            )
        };
        drop(incoming);
        drop(immediate);
        drop(delayed);
        drop(delayed_incoming);
    }

    // ---- tracing -----------------------------------------------------------

    pub(crate) fn as_value(&self, now: TimeTicks, force_verbose: bool) -> Value {
        let main = self.main.lock();
        let any = self.any_thread.lock();
        let mut state = json!({ "name": self.name });
        if any.unregistered {
            state["unregistered"] = json!(true);
            return state;
        }
        state["task_queue_id"] = json!(self.id.value());
        state["enabled"] = json!(main.is_enabled);
        state["priority"] = json!(main.priority.as_str());
        if let Some(domain) = &main.time_domain {
            state["time_domain_name"] = json!(domain.name());
        }
        state["immediate_incoming_queue"] = json!({
            "size": any.immediate_incoming_queue.len(),
            "capacity": any.immediate_incoming_queue.capacity(),
        });
        state["delayed_incoming_queue_size"] = json!(main.delayed_incoming_queue.len());
        state["immediate_work_queue_size"] = json!(main.immediate_work_queue.len());
        state["delayed_work_queue_size"] = json!(main.delayed_work_queue.len());
        state["immediate_work_queue_capacity"] = json!(main.immediate_work_queue.capacity());
        state["delayed_work_queue_capacity"] = json!(main.delayed_work_queue.capacity());
        if let Some(front) = main.delayed_incoming_queue.peek() {
            if let Some(run_time) = front.delayed_run_time {
                state["delay_to_next_task_ms"] =
                    json!(run_time.saturating_since(now).as_secs_f64() * 1_000.0);
            }
        }
        if main.current_fence.is_set() {
            state["current_fence"] = json!(main.current_fence.raw());
        }
        if let Some(deadline) = main.delayed_fence {
            state["delayed_fence_seconds_from_now"] =
                json!(deadline.saturating_since(now).as_secs_f64());
        }
        if force_verbose {
            state["immediate_incoming_queue_tasks"] = Value::Array(
                any.immediate_incoming_queue
                    .iter()
                    .map(|task| task.as_value(now))
                    .collect(),
            );
            state["immediate_work_queue_tasks"] = main.immediate_work_queue.as_value(now);
            state["delayed_work_queue_tasks"] = main.delayed_work_queue.as_value(now);
            state["delayed_incoming_queue_tasks"] = main.delayed_incoming_queue.as_value(now);
        }
        state
    }
}

fn deliver(notifications: Vec<ObserverNotification>) {
    for (observer, wake_up) in notifications {
        observer.on_queue_next_wake_up_changed(wake_up);
    }
}

/// Handle to a task queue owned by a [`SequenceManager`](crate::SequenceManager).
///
/// Cloning the handle is cheap; the queue itself lives until it is
/// unregistered and the last in-flight task referencing it dies.
#[derive(Clone)]
pub struct TaskQueue {
    pub(crate) inner: Arc<TaskQueueInner>,
}

impl TaskQueue {
    /// The queue's debug name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The queue's id within its manager.
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.inner.id()
    }

    /// Creates a runner that posts to this queue with the given task type.
    /// Runners stay valid after unregistration; posting then returns false.
    #[must_use]
    pub fn create_task_runner(&self, task_type: TaskType) -> TaskRunner {
        TaskRunner::new(
            Arc::clone(&self.inner.poster),
            self.inner.main_thread,
            task_type,
        )
    }

    /// Installs a fence. At most one fence exists at a time; any delayed
    /// fence is cleared.
    pub fn insert_fence(&self, position: InsertFencePosition) {
        self.inner.insert_fence(position);
    }

    /// Arms a delayed fence: a `Now` fence auto-installs when a task's queue
    /// time crosses `time`. Panics unless the queue opted in via
    /// [`TaskQueueSpec::with_delayed_fence_allowed`].
    pub fn insert_fence_at(&self, time: TimeTicks) {
        self.inner.insert_fence_at(time);
    }

    /// Removes any fence, unblocking hidden tasks in their original order.
    pub fn remove_fence(&self) {
        self.inner.remove_fence();
    }

    /// True if a fence is installed or a delayed fence has expired.
    #[must_use]
    pub fn has_active_fence(&self) -> bool {
        self.inner.has_active_fence()
    }

    /// True if every pending task is currently hidden behind the fence.
    #[must_use]
    pub fn blocked_by_fence(&self) -> bool {
        self.inner.blocked_by_fence()
    }

    /// Enables or disables the queue. Disabled queues accept posts but never
    /// run tasks nor schedule wake-ups.
    pub fn set_queue_enabled(&self, enabled: bool) {
        self.inner.set_queue_enabled(enabled);
    }

    /// True unless the queue has been disabled.
    #[must_use]
    pub fn is_queue_enabled(&self) -> bool {
        self.inner.is_queue_enabled()
    }

    /// Moves the queue to a priority band.
    pub fn set_queue_priority(&self, priority: QueuePriority) {
        self.inner.set_queue_priority(priority);
    }

    /// The queue's current priority band.
    #[must_use]
    pub fn queue_priority(&self) -> QueuePriority {
        self.inner.queue_priority()
    }

    /// Rebinds the queue's delay ordering to another time domain.
    pub fn set_time_domain(&self, time_domain: TimeDomain) {
        self.inner.set_time_domain(time_domain);
    }

    /// The queue's current time domain. `None` after unregistration.
    #[must_use]
    pub fn time_domain(&self) -> Option<TimeDomain> {
        self.inner.time_domain()
    }

    /// True if no task is pending anywhere in the queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Total pending tasks across all internal queues.
    #[must_use]
    pub fn number_of_pending_tasks(&self) -> usize {
        self.inner.number_of_pending_tasks()
    }

    /// True if an unblocked task could run right now.
    #[must_use]
    pub fn has_task_to_run_immediately(&self) -> bool {
        self.inner.has_task_to_run_immediately()
    }

    /// Number of pending delayed tasks flagged high resolution.
    #[must_use]
    pub fn pending_high_resolution_task_count(&self) -> usize {
        self.inner.pending_high_resolution_task_count()
    }

    /// True if a task with this enqueue order spent its whole queued life
    /// blocked by a fence, disabled, or below normal priority. Task
    /// observers use this to classify long-starved work.
    #[must_use]
    pub fn was_blocked_or_low_priority(&self, enqueue_order: EnqueueOrder) -> bool {
        self.inner.was_blocked_or_low_priority(enqueue_order)
    }

    /// True once [`unregister`](Self::unregister) ran.
    #[must_use]
    pub fn is_unregistered(&self) -> bool {
        self.inner.is_unregistered()
    }

    /// Registers a per-task observer.
    pub fn add_task_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.inner.add_task_observer(observer);
    }

    /// Unregisters a per-task observer.
    pub fn remove_task_observer(&self, observer: &Arc<dyn TaskObserver>) {
        self.inner.remove_task_observer(observer);
    }

    /// Sets or clears the queue observer. Panics when replacing an existing
    /// observer without clearing it first.
    pub fn set_observer(&self, observer: Option<Arc<dyn QueueObserver>>) {
        self.inner.set_observer(observer);
    }

    /// Sets a hook invoked (under the queue lock) for every accepted post.
    pub fn set_on_task_posted_handler(&self, handler: Option<OnTaskPostedHandler>) {
        self.inner.set_on_task_posted_handler(handler);
    }

    /// Sweeps cancelled delayed tasks and returns unused capacity.
    pub fn reclaim_memory(&self, now: TimeTicks) {
        self.inner.reclaim_memory(now);
    }

    /// Detaches the queue from its manager. Posting via existing runners
    /// fails afterwards; queued tasks are dropped without running.
    pub fn unregister(&self) {
        self.inner.unregister();
    }

    /// Tracing snapshot as a nested key/value document.
    #[must_use]
    pub fn as_value(&self, now: TimeTicks, verbose: bool) -> Value {
        self.inner.as_value(now, verbose)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name())
            .field("id", &self.inner.id())
            .finish_non_exhaustive()
    }
}
