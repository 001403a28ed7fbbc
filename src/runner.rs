//! Task runners and the guarded posting path.
//!
//! A [`TaskRunner`] is a cheap, cloneable handle for posting tasks to one
//! queue with a fixed task type. Every post funnels through the queue's
//! [`GuardedTaskPoster`], which enforces two disciplines:
//!
//! - an **operations gate**: posts are accepted only between the queue being
//!   bound to a manager and its unregistration; shutdown waits until every
//!   in-flight post has drained before the queue's cross-thread state is
//!   torn down;
//! - a **re-entrancy guard**: a post that happens while the same thread is
//!   already inside a post (a posted-task hook posting again, for instance)
//!   is deferred to a thread-local buffer and replayed once the outer post
//!   finishes, breaking potential lock cycles.

use crate::error::Result;
use crate::queue::task_queue::TaskQueueInner;
use crate::task::{Callback, Location, Nestable, PostedTask, TaskType};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

const GATE_ACCEPTING: u64 = 1 << 62;
const GATE_SHUTDOWN: u64 = 1 << 63;
const GATE_COUNT_MASK: u64 = GATE_ACCEPTING - 1;

/// Lifecycle gate counting in-flight post operations.
struct OperationsGate {
    state: AtomicU64,
    drained_mutex: Mutex<()>,
    drained: Condvar,
}

impl OperationsGate {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            drained_mutex: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    fn start_accepting(&self) {
        self.state.fetch_or(GATE_ACCEPTING, Ordering::Release);
    }

    /// Tries to begin an operation. On success the caller must balance with
    /// [`end_operation`](Self::end_operation).
    fn try_begin_operation(&self) -> bool {
        let previous = self.state.fetch_add(1, Ordering::Acquire);
        if previous & GATE_ACCEPTING == 0 || previous & GATE_SHUTDOWN != 0 {
            self.end_operation();
            return false;
        }
        true
    }

    fn end_operation(&self) {
        let previous = self.state.fetch_sub(1, Ordering::Release);
        let shutting_down = previous & GATE_SHUTDOWN != 0;
        if shutting_down && previous & GATE_COUNT_MASK == 1 {
            let _guard = self.drained_mutex.lock();
            self.drained.notify_all();
        }
    }

    /// Rejects new operations and blocks until in-flight ones finish.
    fn shutdown_and_drain(&self) {
        self.state.fetch_or(GATE_SHUTDOWN, Ordering::AcqRel);
        let mut guard = self.drained_mutex.lock();
        while self.state.load(Ordering::Acquire) & GATE_COUNT_MASK != 0 {
            self.drained.wait_for(&mut guard, Duration::from_millis(10));
        }
    }
}

thread_local! {
    /// `Some` while this thread is inside a post; holds posts to replay.
    static DEFERRED_POSTS: RefCell<Option<Vec<(Arc<GuardedTaskPoster>, PostedTask)>>> =
        const { RefCell::new(None) };
}

/// Clears the defer scope on drop and replays anything buffered meanwhile.
struct DeferScope;

impl DeferScope {
    /// Activates the scope. Returns `None` if one is already active on this
    /// thread, in which case the caller must defer instead of posting.
    fn try_activate() -> Option<Self> {
        DEFERRED_POSTS.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return None;
            }
            *slot = Some(Vec::new());
            Some(Self)
        })
    }

    fn defer(poster: Arc<GuardedTaskPoster>, task: PostedTask) {
        DEFERRED_POSTS.with(|cell| {
            cell.borrow_mut()
                .as_mut()
                .expect("defer scope active")
                .push((poster, task));
        });
    }
}

impl Drop for DeferScope {
    fn drop(&mut self) {
        let deferred = DEFERRED_POSTS.with(|cell| cell.borrow_mut().take());
        for (poster, task) in deferred.into_iter().flatten() {
            // Replays re-enter post_task with the scope inactive again.
            GuardedTaskPoster::post_task(&poster, task);
        }
    }
}

/// The posting front door of one task queue.
pub(crate) struct GuardedTaskPoster {
    queue: Weak<TaskQueueInner>,
    gate: OperationsGate,
}

impl GuardedTaskPoster {
    pub(crate) fn new(queue: Weak<TaskQueueInner>) -> Self {
        Self {
            queue,
            gate: OperationsGate::new(),
        }
    }

    /// Opens the gate once the queue is bound to its manager.
    pub(crate) fn start_accepting_operations(&self) {
        self.gate.start_accepting();
    }

    /// Closes the gate and waits for in-flight posts to drain.
    pub(crate) fn shutdown_and_drain_operations(&self) {
        self.gate.shutdown_and_drain();
    }

    /// Posts a task, honoring the re-entrancy guard and the gate. Returns
    /// true iff the task was accepted (a deferred post counts as accepted;
    /// it is replayed as soon as the outer post returns).
    pub(crate) fn post_task(this: &Arc<Self>, task: PostedTask) -> bool {
        let Some(_scope) = DeferScope::try_activate() else {
            DeferScope::defer(Arc::clone(this), task);
            return true;
        };
        match this.post_task_gated(task) {
            Ok(()) => true,
            Err(error) => {
                // The quiet `false` surface is reserved for expected
                // rejections; anything else leaking out of the post path is
                // a bug in this crate.
                debug_assert!(
                    error.kind().is_rejection(),
                    "posting failed with a non-rejection error: {error}"
                );
                false
            }
        }
    }

    fn post_task_gated(&self, task: PostedTask) -> Result<()> {
        if !self.gate.try_begin_operation() {
            return Err(crate::error::Error::new(
                crate::error::ErrorKind::NotAccepting,
            ));
        }
        let result = match self.queue.upgrade() {
            Some(queue) => queue.post_task(task),
            None => Err(crate::error::Error::new(
                crate::error::ErrorKind::QueueUnregistered,
            )),
        };
        self.gate.end_operation();
        result
    }
}

/// A reference-counted handle for posting tasks to one queue.
///
/// The handle outlives its queue's unregistration; posting then returns
/// `false` and the callback is dropped.
#[derive(Clone)]
pub struct TaskRunner {
    poster: Arc<GuardedTaskPoster>,
    main_thread: ThreadId,
    task_type: TaskType,
}

impl TaskRunner {
    pub(crate) fn new(
        poster: Arc<GuardedTaskPoster>,
        main_thread: ThreadId,
        task_type: TaskType,
    ) -> Self {
        Self {
            poster,
            main_thread,
            task_type,
        }
    }

    /// The task type stamped on every task this runner posts.
    #[must_use]
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Posts an immediate task. Returns true iff the task was accepted.
    pub fn post_task(&self, posted_from: Location, callback: impl Into<Callback>) -> bool {
        self.post_delayed_task(posted_from, callback, Duration::ZERO)
    }

    /// Posts a task to run no earlier than `delay` from now. Returns true
    /// iff the task was accepted; a rejected post drops the callback.
    pub fn post_delayed_task(
        &self,
        posted_from: Location,
        callback: impl Into<Callback>,
        delay: Duration,
    ) -> bool {
        let mut task = PostedTask::new(posted_from, callback.into()).with_delay(delay);
        task.task_type = self.task_type;
        GuardedTaskPoster::post_task(&self.poster, task)
    }

    /// Posts an immediate task that must not run in a nested run loop.
    pub fn post_non_nestable_task(
        &self,
        posted_from: Location,
        callback: impl Into<Callback>,
    ) -> bool {
        self.post_non_nestable_delayed_task(posted_from, callback, Duration::ZERO)
    }

    /// Posts a delayed task that must not run in a nested run loop.
    pub fn post_non_nestable_delayed_task(
        &self,
        posted_from: Location,
        callback: impl Into<Callback>,
        delay: Duration,
    ) -> bool {
        let mut task = PostedTask::new(posted_from, callback.into())
            .with_delay(delay)
            .with_nestable(Nestable::NonNestable);
        task.task_type = self.task_type;
        GuardedTaskPoster::post_task(&self.poster, task)
    }

    /// Posts a fully-specified task.
    pub fn post_posted_task(&self, mut task: PostedTask) -> bool {
        task.task_type = self.task_type;
        GuardedTaskPoster::post_task(&self.poster, task)
    }

    /// True when called from the thread the owning manager is bound to.
    #[must_use]
    pub fn runs_tasks_in_current_sequence(&self) -> bool {
        std::thread::current().id() == self.main_thread
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("task_type", &self.task_type)
            .finish_non_exhaustive()
    }
}

/// Keeps a short list of runners alive, for embedders that hand out many
/// per-component runners from one queue.
#[derive(Debug, Default, Clone)]
pub struct TaskRunnerSet {
    runners: SmallVec<[TaskRunner; 4]>,
}

impl TaskRunnerSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a runner to the set.
    pub fn insert(&mut self, runner: TaskRunner) {
        self.runners.push(runner);
    }

    /// Number of retained runners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// True if no runner is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Iterates the retained runners.
    pub fn iter(&self) -> impl Iterator<Item = &TaskRunner> {
        self.runners.iter()
    }
}
