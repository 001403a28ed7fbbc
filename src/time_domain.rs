//! Delay ordering: the per-queue wake-up heap.
//!
//! A [`TimeDomain`] pairs a tick clock with an ordered set of `(wake-up,
//! queue)` entries, at most one per queue. Whenever the earliest entry
//! changes, the domain reprograms the thread controller: an earlier deadline
//! re-arms the delayed-work timer, a deadline already in the past requests an
//! immediate dispatch. The domain also counts queues whose next wake-up needs
//! a high-resolution timer so a driver can raise platform timer resolution
//! while any are pending.
//!
//! The heap is main-thread-only; cross-thread posters touch a domain only
//! through its clock.

use crate::manager::ManagerShared;
use crate::time::{LazyNow, TickClock, TimeTicks, WakeUp, WakeUpResolution};
use crate::types::QueueId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, Weak};

struct WakeUpHeap {
    /// Ordered `(time, queue)` pairs; the first element is the earliest.
    entries: BTreeSet<(TimeTicks, QueueId)>,
    /// Current wake-up per queue, the handle used for in-place re-keying.
    by_queue: HashMap<QueueId, WakeUp>,
    high_res_count: usize,
}

pub(crate) struct TimeDomainInner {
    name: String,
    clock: Arc<dyn TickClock>,
    manager: OnceLock<Weak<ManagerShared>>,
    heap: Mutex<WakeUpHeap>,
}

/// A clock plus the min-heap of next wake-ups over the queues bound to it.
#[derive(Clone)]
pub struct TimeDomain {
    inner: Arc<TimeDomainInner>,
}

impl TimeDomain {
    /// Creates a domain over the given clock.
    #[must_use]
    pub fn new(name: impl Into<String>, clock: Arc<dyn TickClock>) -> Self {
        Self {
            inner: Arc::new(TimeDomainInner {
                name: name.into(),
                clock,
                manager: OnceLock::new(),
                heap: Mutex::new(WakeUpHeap {
                    entries: BTreeSet::new(),
                    by_queue: HashMap::new(),
                    high_res_count: 0,
                }),
            }),
        }
    }

    /// The domain's debug name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The domain's current time.
    #[must_use]
    pub fn now(&self) -> TimeTicks {
        self.inner.clock.now_ticks()
    }

    /// The domain's clock, shared with cross-thread posting paths.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn TickClock> {
        Arc::clone(&self.inner.clock)
    }

    /// True if both handles refer to the same domain.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The earliest scheduled wake-up across all bound queues.
    #[must_use]
    pub fn next_scheduled_run_time(&self) -> Option<TimeTicks> {
        self.inner.heap.lock().entries.first().map(|entry| entry.0)
    }

    /// Number of queues whose next wake-up needs a high-resolution timer.
    #[must_use]
    pub fn pending_high_res_wake_up_count(&self) -> usize {
        self.inner.heap.lock().high_res_count
    }

    pub(crate) fn bind_to_manager(&self, manager: &Arc<ManagerShared>) {
        let _ = self.inner.manager.set(Arc::downgrade(manager));
    }

    /// Inserts, re-keys or removes `queue`'s entry. When the heap minimum
    /// changes, the controller is reprogrammed: to an immediate dispatch if
    /// the new minimum already passed, to a delayed one otherwise.
    pub(crate) fn set_next_wake_up_for_queue(
        &self,
        queue: QueueId,
        wake_up: Option<WakeUp>,
        lazy_now: &mut LazyNow<'_>,
    ) {
        let (previous_min, new_min) = {
            let mut heap = self.inner.heap.lock();
            let previous_min = heap.entries.first().map(|entry| entry.0);

            if let Some(previous) = heap.by_queue.remove(&queue) {
                heap.entries.remove(&(previous.time, queue));
                if previous.resolution == WakeUpResolution::High {
                    debug_assert!(heap.high_res_count > 0);
                    heap.high_res_count -= 1;
                }
            }
            if let Some(wake_up) = wake_up {
                heap.entries.insert((wake_up.time, queue));
                heap.by_queue.insert(queue, wake_up);
                if wake_up.resolution == WakeUpResolution::High {
                    heap.high_res_count += 1;
                }
            }

            (previous_min, heap.entries.first().map(|entry| entry.0))
        };

        if new_min == previous_min {
            return;
        }
        let Some(manager) = self.inner.manager.get().and_then(Weak::upgrade) else {
            return;
        };
        match new_min {
            None => manager.set_next_delayed_do_work(None),
            Some(time) if time <= lazy_now.now() => manager.schedule_work(),
            Some(time) => manager.set_next_delayed_do_work(Some(time)),
        }
    }

    /// The queue owning the earliest wake-up, if it is due at `now`.
    ///
    /// The entry is left in place; promoting the queue's ready tasks
    /// recomputes its wake-up, which removes or re-keys the entry.
    pub(crate) fn next_due_queue(&self, now: TimeTicks) -> Option<QueueId> {
        let heap = self.inner.heap.lock();
        let &(time, queue) = heap.entries.first()?;
        (time <= now).then_some(queue)
    }

    /// Forcibly drops a queue's entry; used when the queue is gone.
    pub(crate) fn remove_queue_entry(&self, queue: QueueId) {
        let mut heap = self.inner.heap.lock();
        if let Some(previous) = heap.by_queue.remove(&queue) {
            heap.entries.remove(&(previous.time, queue));
            if previous.resolution == WakeUpResolution::High {
                heap.high_res_count -= 1;
            }
        }
    }

    /// Tracing snapshot.
    #[must_use]
    pub fn as_value(&self) -> Value {
        let heap = self.inner.heap.lock();
        let mut state = json!({
            "name": self.inner.name,
            "registered_delay_count": heap.entries.len(),
        });
        if let Some(&(time, _)) = heap.entries.first() {
            let delay = time.saturating_since(self.now());
            state["next_delay_ms"] = json!(delay.as_secs_f64() * 1_000.0);
        }
        state
    }
}

impl std::fmt::Debug for TimeDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let heap = self.inner.heap.lock();
        f.debug_struct("TimeDomain")
            .field("name", &self.inner.name)
            .field("entries", &heap.entries.len())
            .field("high_res_count", &heap.high_res_count)
            .finish()
    }
}
