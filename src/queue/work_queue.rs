//! A single-priority, single-consumer FIFO of committed tasks.
//!
//! Each task queue owns two work queues, one populated by the cross-thread
//! staging deque (immediate) and one by the delayed incoming heap (delayed).
//! A work queue may carry a fence: tasks whose enqueue order is at or above
//! the fence are hidden from the selector until the fence is removed.

use crate::task::Task;
use crate::time::TimeTicks;
use crate::types::EnqueueOrder;
use serde_json::Value;
use std::collections::VecDeque;

/// Which of a task queue's two work queues this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkQueueKind {
    /// Fed from the cross-thread staging deque.
    Immediate,
    /// Fed from the delayed incoming heap as deadlines pass.
    Delayed,
}

impl WorkQueueKind {
    /// Stable name for tracing.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Delayed => "delayed",
        }
    }
}

/// Below this capacity the backing deque is never shrunk.
const MIN_SHRINK_CAPACITY: usize = 16;

/// An ordered run of tasks, consumed from the front, appended at the back.
///
/// Invariant: enqueue orders are strictly increasing front to back, except
/// for re-queued non-nestable tasks which are pushed at the front carrying
/// their original (smaller) order.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    tasks: VecDeque<Task>,
    kind: WorkQueueKind,
    fence: EnqueueOrder,
}

impl WorkQueue {
    pub(crate) fn new(kind: WorkQueueKind) -> Self {
        Self {
            tasks: VecDeque::new(),
            kind,
            fence: EnqueueOrder::NONE,
        }
    }

    pub(crate) fn kind(&self) -> WorkQueueKind {
        self.kind
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.tasks.capacity()
    }

    /// Enqueue order of the front task, if any.
    pub(crate) fn front_task_order(&self) -> Option<EnqueueOrder> {
        self.tasks.front().map(Task::enqueue_order)
    }

    /// Appends a committed task. The caller guarantees monotonic orders.
    pub(crate) fn push(&mut self, task: Task) {
        debug_assert!(task.enqueue_order_set());
        debug_assert!(
            self.tasks
                .back()
                .is_none_or(|back| back.enqueue_order() < task.enqueue_order()),
            "work queue must stay monotonic in enqueue order"
        );
        self.tasks.push_back(task);
    }

    /// Appends a batch drained from the staging deque.
    pub(crate) fn append(&mut self, tasks: VecDeque<Task>) {
        debug_assert!(self.tasks.is_empty());
        self.tasks = tasks;
    }

    /// Re-queues a deferred non-nestable task at the front, keeping its
    /// original enqueue order.
    pub(crate) fn push_non_nestable_task_to_front(&mut self, task: Task) {
        debug_assert!(task.enqueue_order_set());
        debug_assert!(
            self.tasks
                .front()
                .is_none_or(|front| task.enqueue_order() < front.enqueue_order()),
            "re-queued task must order before the current front"
        );
        self.tasks.push_front(task);
    }

    /// Removes and returns the front task. The selector only calls this for
    /// an unblocked, non-empty queue.
    pub(crate) fn take_front(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// True if the fence currently hides the front task (an empty fenced
    /// queue counts as blocked: everything posted later is hidden).
    pub(crate) fn blocked_by_fence(&self) -> bool {
        if !self.fence.is_set() {
            return false;
        }
        self.tasks
            .front()
            .is_none_or(|front| front.enqueue_order() >= self.fence)
    }

    pub(crate) fn has_fence(&self) -> bool {
        self.fence.is_set()
    }

    /// Installs a fence. Returns true if the front task was blocked before
    /// and is now runnable (a fence moved past it).
    pub(crate) fn insert_fence(&mut self, fence: EnqueueOrder) -> bool {
        debug_assert!(fence.is_set());
        let was_blocked = self.blocked_by_fence();
        self.fence = fence;
        was_blocked && !self.blocked_by_fence()
    }

    /// Installs a fence without reporting unblocking; used while draining the
    /// staging deque, where the caller refreshes the selector wholesale.
    pub(crate) fn insert_fence_silently(&mut self, fence: EnqueueOrder) {
        debug_assert!(fence.is_set());
        self.fence = fence;
    }

    /// Removes the fence. Returns true if the front task becomes runnable.
    pub(crate) fn remove_fence(&mut self) -> bool {
        let was_blocked = self.blocked_by_fence();
        self.fence = EnqueueOrder::NONE;
        was_blocked && !self.tasks.is_empty()
    }

    /// Gives back capacity when the queue is wasting memory.
    pub(crate) fn maybe_shrink(&mut self) {
        let capacity = self.tasks.capacity();
        if capacity > MIN_SHRINK_CAPACITY && self.tasks.len() * 2 < capacity {
            self.tasks.shrink_to(self.tasks.len().max(MIN_SHRINK_CAPACITY / 2) * 2);
        }
    }

    /// Drains every task for teardown. The caller drops them outside locks.
    pub(crate) fn take_all(&mut self) -> VecDeque<Task> {
        std::mem::take(&mut self.tasks)
    }

    /// Tracing snapshot: the full task listing.
    pub(crate) fn as_value(&self, now: TimeTicks) -> Value {
        Value::Array(self.tasks.iter().map(|t| t.as_value(now)).collect())
    }
}
