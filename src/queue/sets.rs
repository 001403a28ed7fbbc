//! Per-priority-band indexing of ready work queues.
//!
//! Each band keeps an ordered map from front-task enqueue order to the work
//! queue holding that task. Selection walks bands from most to least
//! important and returns the smallest enqueue order in the first non-empty
//! band. Enqueue orders are globally unique, so keys never collide.
//!
//! Only *eligible* work queues appear here: non-empty, unblocked by any
//! fence, and belonging to an enabled queue. The sequence manager keeps
//! membership in sync after every mutation that can change a front task.

use crate::queue::work_queue::WorkQueueKind;
use crate::types::{EnqueueOrder, QueueId, QueuePriority};
use std::collections::{BTreeMap, HashMap};

/// The work queue chosen by [`WorkQueueSets::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SelectedWorkQueue {
    pub queue: QueueId,
    pub kind: WorkQueueKind,
    pub order: EnqueueOrder,
}

#[derive(Debug)]
pub(crate) struct WorkQueueSets {
    bands: [BTreeMap<EnqueueOrder, (QueueId, WorkQueueKind)>; QueuePriority::COUNT],
    /// Where each member currently sits, for O(log n) re-keying.
    members: HashMap<(QueueId, WorkQueueKind), (usize, EnqueueOrder)>,
}

impl WorkQueueSets {
    pub(crate) fn new() -> Self {
        Self {
            bands: std::array::from_fn(|_| BTreeMap::new()),
            members: HashMap::new(),
        }
    }

    /// Inserts, re-keys or removes one work queue's entry.
    ///
    /// `front` is the enqueue order of the queue's front task, or `None` if
    /// the work queue is currently ineligible for selection.
    pub(crate) fn update(
        &mut self,
        queue: QueueId,
        kind: WorkQueueKind,
        priority: QueuePriority,
        front: Option<EnqueueOrder>,
    ) {
        let band = priority.index();
        match (self.members.get(&(queue, kind)).copied(), front) {
            (Some((old_band, old_key)), Some(key)) => {
                if old_band == band && old_key == key {
                    return;
                }
                self.bands[old_band].remove(&old_key);
                self.bands[band].insert(key, (queue, kind));
                self.members.insert((queue, kind), (band, key));
            }
            (Some((old_band, old_key)), None) => {
                self.bands[old_band].remove(&old_key);
                self.members.remove(&(queue, kind));
            }
            (None, Some(key)) => {
                self.bands[band].insert(key, (queue, kind));
                self.members.insert((queue, kind), (band, key));
            }
            (None, None) => {}
        }
    }

    /// Drops both of a queue's work queues from the sets.
    pub(crate) fn remove_queue(&mut self, queue: QueueId) {
        for kind in [WorkQueueKind::Immediate, WorkQueueKind::Delayed] {
            if let Some((band, key)) = self.members.remove(&(queue, kind)) {
                self.bands[band].remove(&key);
            }
        }
    }

    /// Returns the work queue whose front task has the smallest enqueue
    /// order within the most important non-empty band.
    pub(crate) fn select(&self) -> Option<SelectedWorkQueue> {
        for band in &self.bands {
            if let Some((&order, &(queue, kind))) = band.iter().next() {
                return Some(SelectedWorkQueue { queue, kind, order });
            }
        }
        None
    }

    /// True if any work queue is eligible for selection.
    pub(crate) fn has_ready_work(&self) -> bool {
        !self.members.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.members.len()
    }
}
