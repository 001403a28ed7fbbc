//! Posted units of work.
//!
//! A [`PostedTask`] is what a caller hands to a task runner: a callback, the
//! posting location and a delay. Once accepted it becomes a [`Task`] with a
//! sequence number (and, when committed to a work queue, an enqueue order).
//!
//! Callbacks support the weak-reference cancellation model: a callback bound
//! to an owner via [`Callback::bound`] turns into a no-op once the owner is
//! dropped, and the queues reclaim such tasks without running them.

use crate::time::TimeTicks;
use crate::types::EnqueueOrder;
use core::fmt;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A source-code location captured at the post site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    file: &'static str,
    line: u32,
}

impl Location {
    /// Captures the caller's location.
    #[must_use]
    #[track_caller]
    pub fn caller() -> Self {
        let loc = core::panic::Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }

    /// Builds a location from explicit parts.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// The file the task was posted from.
    #[must_use]
    pub const fn file(&self) -> &'static str {
        self.file
    }

    /// The line the task was posted from.
    #[must_use]
    pub const fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Whether a task may run inside a nested run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Nestable {
    /// May run in any run loop, nested or not.
    #[default]
    Nestable,
    /// Deferred until control returns to the outermost run loop.
    NonNestable,
}

/// An opaque tag carried by every task runner and stamped on its tasks.
///
/// The sequencing core does not interpret it; embedders use it to route
/// per-task accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TaskType(pub u8);

impl TaskType {
    /// The default tag.
    pub const DEFAULT: Self = Self(0);
}

type BoxedClosure = Box<dyn FnOnce() + Send + 'static>;

/// A one-shot callback, optionally bound to a weakly-referenced owner.
pub struct Callback {
    f: BoxedClosure,
    validity: Option<Weak<dyn Any + Send + Sync>>,
}

impl Callback {
    /// Wraps a plain closure.
    #[must_use]
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            f: Box::new(f),
            validity: None,
        }
    }

    /// Wraps a closure whose validity is tied to `owner`: once the last
    /// strong reference to `owner` is gone the callback is cancelled and
    /// will never run.
    #[must_use]
    pub fn bound<T: Send + Sync + 'static>(
        owner: &Arc<T>,
        f: impl FnOnce() + Send + 'static,
    ) -> Self {
        let weak: Weak<T> = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        Self {
            f: Box::new(f),
            validity: Some(weak),
        }
    }

    /// True once the bound owner has been dropped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.validity
            .as_ref()
            .is_some_and(|weak| weak.strong_count() == 0)
    }

    /// Runs the callback unless it has been cancelled.
    pub fn run(self) {
        if self.is_cancelled() {
            return;
        }
        (self.f)();
    }
}

impl<F: FnOnce() + Send + 'static> From<F> for Callback {
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("bound", &self.validity.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A task as handed to a task runner, before it is accepted by a queue.
#[derive(Debug)]
pub struct PostedTask {
    /// The work to run.
    pub callback: Callback,
    /// Where the post happened.
    pub posted_from: Location,
    /// Zero for an immediate task.
    pub delay: Duration,
    /// Nested-run-loop policy.
    pub nestable: Nestable,
    /// The posting runner's tag.
    pub task_type: TaskType,
    /// Sampled when the owning queue records queue times.
    pub queue_time: Option<TimeTicks>,
    /// Optional opaque IPC correlation hash, surfaced in snapshots.
    pub ipc_hash: Option<u32>,
}

impl PostedTask {
    /// Builds an immediate, nestable task with the default tag.
    #[must_use]
    pub fn new(posted_from: Location, callback: Callback) -> Self {
        Self {
            callback,
            posted_from,
            delay: Duration::ZERO,
            nestable: Nestable::Nestable,
            task_type: TaskType::DEFAULT,
            queue_time: None,
            ipc_hash: None,
        }
    }

    /// Sets the delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the nestability.
    #[must_use]
    pub fn with_nestable(mut self, nestable: Nestable) -> Self {
        self.nestable = nestable;
        self
    }
}

/// A task accepted by a queue.
///
/// Movable, not copyable; destroyed after execution. For an immediate task
/// the enqueue order equals the sequence number and is assigned at post time.
/// A delayed task is assigned its enqueue order only when it moves to a work
/// queue, so it merges correctly with immediate tasks posted meanwhile.
#[derive(Debug)]
pub struct Task {
    /// The work to run.
    pub callback: Callback,
    /// Where the post happened.
    pub posted_from: Location,
    /// Sampled at post when the queue records queue times.
    pub queue_time: Option<TimeTicks>,
    /// Generation-unique number assigned at post.
    pub sequence_num: u64,
    /// When the task becomes due; `None` for immediate tasks.
    pub delayed_run_time: Option<TimeTicks>,
    /// Nested-run-loop policy.
    pub nestable: Nestable,
    /// True if the delay was short enough to need a fine-grained timer.
    pub is_high_res: bool,
    /// The posting runner's tag.
    pub task_type: TaskType,
    /// Optional opaque IPC correlation hash.
    pub ipc_hash: Option<u32>,
    enqueue_order: EnqueueOrder,
}

impl Task {
    pub(crate) fn new(
        posted: PostedTask,
        delayed_run_time: Option<TimeTicks>,
        sequence_num: u64,
        enqueue_order: EnqueueOrder,
        is_high_res: bool,
    ) -> Self {
        Self {
            callback: posted.callback,
            posted_from: posted.posted_from,
            queue_time: posted.queue_time,
            sequence_num,
            delayed_run_time,
            nestable: posted.nestable,
            is_high_res,
            task_type: posted.task_type,
            ipc_hash: posted.ipc_hash,
            enqueue_order,
        }
    }

    /// The committed enqueue order. Panics if it has not been assigned.
    #[must_use]
    pub fn enqueue_order(&self) -> EnqueueOrder {
        debug_assert!(self.enqueue_order.is_set(), "enqueue order not assigned");
        self.enqueue_order
    }

    /// True once the task has been committed to a work queue.
    #[must_use]
    pub fn enqueue_order_set(&self) -> bool {
        self.enqueue_order.is_set()
    }

    pub(crate) fn set_enqueue_order(&mut self, order: EnqueueOrder) {
        debug_assert!(!self.enqueue_order.is_set());
        self.enqueue_order = order;
    }

    /// True once the callback's bound owner has been dropped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.callback.is_cancelled()
    }

    /// Consumes the task, destroying everything but the callback and its
    /// provenance. The work loop does this before running the callback so
    /// the task object is gone by the time observers hear about completion.
    pub(crate) fn into_parts(self) -> (Callback, Location) {
        (self.callback, self.posted_from)
    }

    /// Tracing snapshot of one task.
    #[must_use]
    pub fn as_value(&self, now: TimeTicks) -> Value {
        let delayed_ms_from_now = self
            .delayed_run_time
            .map_or(0.0, |t| t.saturating_since(now).as_secs_f64() * 1_000.0);
        let mut state = json!({
            "posted_from": self.posted_from.to_string(),
            "sequence_num": self.sequence_num,
            "nestable": self.nestable == Nestable::Nestable,
            "is_high_res": self.is_high_res,
            "is_cancelled": self.is_cancelled(),
            "delayed_run_time": self.delayed_run_time.map(TimeTicks::as_millis_f64),
            "delayed_run_time_milliseconds_from_now": delayed_ms_from_now,
        });
        if self.enqueue_order_set() {
            state["enqueue_order"] = json!(self.enqueue_order.raw());
        }
        if let Some(ipc_hash) = self.ipc_hash {
            state["ipc_hash"] = json!(ipc_hash);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn location_caller_points_here() {
        let loc = Location::caller();
        assert!(loc.file().ends_with("task.rs"));
        assert!(loc.line() > 0);
        assert!(loc.to_string().contains("task.rs:"));
    }

    #[test]
    fn plain_callback_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let cb = Callback::new(move || flag.store(true, Ordering::SeqCst));
        assert!(!cb.is_cancelled());
        cb.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn bound_callback_cancels_when_owner_dropped() {
        let ran = Arc::new(AtomicBool::new(false));
        let owner = Arc::new(());
        let flag = ran.clone();
        let cb = Callback::bound(&owner, move || flag.store(true, Ordering::SeqCst));
        drop(owner);
        assert!(cb.is_cancelled());
        cb.run();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn bound_callback_runs_while_owner_alive() {
        let ran = Arc::new(AtomicBool::new(false));
        let owner = Arc::new(42_u32);
        let flag = ran.clone();
        let cb = Callback::bound(&owner, move || flag.store(true, Ordering::SeqCst));
        assert!(!cb.is_cancelled());
        cb.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn task_enqueue_order_assignment() {
        let posted = PostedTask::new(Location::caller(), Callback::new(|| {}));
        let mut task = Task::new(posted, None, 7, EnqueueOrder::NONE, false);
        assert!(!task.enqueue_order_set());
        task.set_enqueue_order(EnqueueOrder::from_raw(9));
        assert!(task.enqueue_order_set());
        assert_eq!(task.enqueue_order().raw(), 9);
    }

    #[test]
    fn task_snapshot_has_expected_keys() {
        let posted = PostedTask::new(Location::caller(), Callback::new(|| {}));
        let task = Task::new(
            posted,
            Some(TimeTicks::from_millis(20)),
            3,
            EnqueueOrder::NONE,
            true,
        );
        let value = task.as_value(TimeTicks::from_millis(5));
        assert_eq!(value["sequence_num"], 3);
        assert_eq!(value["is_high_res"], true);
        assert_eq!(value["delayed_run_time_milliseconds_from_now"], 15.0);
        assert!(value.get("enqueue_order").is_none());
    }
}
