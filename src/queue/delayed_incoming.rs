//! The min-heap of not-yet-due delayed tasks.
//!
//! Ordered by (delayed run time, sequence number) so that two tasks sharing a
//! deadline keep their post order. The heap tracks how many of its tasks are
//! high resolution, and supports a cancellation sweep that rebuilds the heap
//! only when it actually removed something.

use crate::task::Task;
use crate::time::TimeTicks;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug)]
struct ByRunTime(Task);

impl ByRunTime {
    fn key(&self) -> (Option<TimeTicks>, u64) {
        (self.0.delayed_run_time, self.0.sequence_num)
    }
}

impl Ord for ByRunTime {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest run time first).
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for ByRunTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ByRunTime {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ByRunTime {}

/// Priority queue of delayed tasks awaiting their deadline.
#[derive(Debug, Default)]
pub(crate) struct DelayedIncomingQueue {
    heap: BinaryHeap<ByRunTime>,
    pending_high_res_tasks: usize,
}

impl DelayedIncomingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Number of high-resolution tasks currently in the heap.
    pub(crate) fn pending_high_res_count(&self) -> usize {
        self.pending_high_res_tasks
    }

    pub(crate) fn has_pending_high_res_tasks(&self) -> bool {
        self.pending_high_res_tasks > 0
    }

    pub(crate) fn push(&mut self, task: Task) {
        debug_assert!(task.delayed_run_time.is_some());
        if task.is_high_res {
            self.pending_high_res_tasks += 1;
        }
        self.heap.push(ByRunTime(task));
    }

    /// The task with the earliest (run time, sequence) key.
    pub(crate) fn peek(&self) -> Option<&Task> {
        self.heap.peek().map(|entry| &entry.0)
    }

    pub(crate) fn pop(&mut self) -> Option<Task> {
        let entry = self.heap.pop()?;
        if entry.0.is_high_res {
            debug_assert!(self.pending_high_res_tasks > 0);
            self.pending_high_res_tasks -= 1;
        }
        Some(entry.0)
    }

    /// Removes every cancelled task in one pass and returns them so the
    /// caller can drop them outside any lock (task destructors may post).
    ///
    /// The heap is rebuilt only when something was removed, so a sweep that
    /// finds nothing leaves the heap untouched.
    pub(crate) fn sweep_cancelled_tasks(&mut self) -> Vec<Task> {
        if !self.heap.iter().any(|entry| entry.0.is_cancelled()) {
            return Vec::new();
        }
        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.0.is_cancelled() {
                if entry.0.is_high_res {
                    debug_assert!(self.pending_high_res_tasks > 0);
                    self.pending_high_res_tasks -= 1;
                }
                removed.push(entry.0);
            } else {
                kept.push(entry);
            }
        }
        self.heap = BinaryHeap::from(kept);
        removed
    }

    /// Drains every task for teardown.
    pub(crate) fn take_all(&mut self) -> Vec<Task> {
        self.pending_high_res_tasks = 0;
        std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .map(|entry| entry.0)
            .collect()
    }

    /// Tracing snapshot: the full task listing, heap order.
    pub(crate) fn as_value(&self, now: TimeTicks) -> Value {
        Value::Array(self.heap.iter().map(|entry| entry.0.as_value(now)).collect())
    }
}
