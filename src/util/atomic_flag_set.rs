//! A lock-free set of flags with stable handles.
//!
//! Posters flip a queue's "needs reload" flag without taking any lock beyond
//! the queue's own; the main thread drains all active flags once per work
//! batch. Flags are grouped 64 to an atomic word. Allocation and release are
//! rare and take a mutex; set/clear and the drain of the words themselves are
//! atomic operations only.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SLOTS_PER_GROUP: usize = 64;

#[derive(Debug)]
struct Group {
    flags: AtomicU64,
    /// Slot -> registered id. Written under the set's allocation mutex,
    /// read during drain on the draining thread.
    slots: Mutex<[Option<u64>; SLOTS_PER_GROUP]>,
}

impl Group {
    fn new() -> Self {
        Self {
            flags: AtomicU64::new(0),
            slots: Mutex::new([None; SLOTS_PER_GROUP]),
        }
    }
}

/// A set of atomically-flippable flags, each identified by a caller id.
#[derive(Debug, Default)]
pub(crate) struct AtomicFlagSet {
    groups: Mutex<Vec<Arc<Group>>>,
}

impl AtomicFlagSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a flag for `id` and returns its handle. The flag starts
    /// inactive.
    pub(crate) fn add_flag(&self, id: u64) -> AtomicFlag {
        let mut groups = self.groups.lock();
        for group in groups.iter() {
            let mut slots = group.slots.lock();
            if let Some(bit) = slots.iter().position(Option::is_none) {
                slots[bit] = Some(id);
                return AtomicFlag {
                    group: Arc::clone(group),
                    bit: bit as u32,
                };
            }
        }
        let group = Arc::new(Group::new());
        group.slots.lock()[0] = Some(id);
        groups.push(Arc::clone(&group));
        AtomicFlag { group, bit: 0 }
    }

    /// Clears every active flag, invoking `f` with the registered id of each
    /// flag that was set.
    pub(crate) fn run_active(&self, mut f: impl FnMut(u64)) {
        let groups: Vec<Arc<Group>> = self.groups.lock().clone();
        for group in groups {
            let mut bits = group.flags.swap(0, Ordering::AcqRel);
            if bits == 0 {
                continue;
            }
            let slots = group.slots.lock();
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                if let Some(id) = slots[bit] {
                    f(id);
                }
            }
        }
    }
}

/// Handle to one flag in an [`AtomicFlagSet`].
///
/// Dropping the handle releases the slot and clears any pending activation.
#[derive(Debug)]
pub(crate) struct AtomicFlag {
    group: Arc<Group>,
    bit: u32,
}

impl AtomicFlag {
    /// Sets or clears the flag. Lock-free.
    pub(crate) fn set_active(&self, active: bool) {
        let mask = 1_u64 << self.bit;
        if active {
            self.group.flags.fetch_or(mask, Ordering::Release);
        } else {
            self.group.flags.fetch_and(!mask, Ordering::Release);
        }
    }
}

impl Drop for AtomicFlag {
    fn drop(&mut self) {
        self.set_active(false);
        self.group.slots.lock()[self.bit as usize] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn drain(set: &AtomicFlagSet) -> Vec<u64> {
        let mut out = Vec::new();
        set.run_active(|id| out.push(id));
        out.sort_unstable();
        out
    }

    #[test]
    fn set_and_drain() {
        let set = AtomicFlagSet::new();
        let a = set.add_flag(1);
        let b = set.add_flag(2);
        a.set_active(true);
        assert_eq!(drain(&set), vec![1]);
        // Drained flags stay clear.
        assert_eq!(drain(&set), Vec::<u64>::new());
        a.set_active(true);
        b.set_active(true);
        assert_eq!(drain(&set), vec![1, 2]);
    }

    #[test]
    fn clearing_before_drain_hides_flag() {
        let set = AtomicFlagSet::new();
        let a = set.add_flag(9);
        a.set_active(true);
        a.set_active(false);
        assert_eq!(drain(&set), Vec::<u64>::new());
    }

    #[test]
    fn released_slot_is_reused() {
        let set = AtomicFlagSet::new();
        let a = set.add_flag(1);
        a.set_active(true);
        drop(a);
        // The pending activation must not leak into the reused slot's id.
        let _b = set.add_flag(2);
        assert_eq!(drain(&set), Vec::<u64>::new());
    }

    #[test]
    fn grows_past_one_group() {
        let set = AtomicFlagSet::new();
        let handles: Vec<_> = (0..130).map(|i| set.add_flag(i)).collect();
        for handle in &handles {
            handle.set_active(true);
        }
        assert_eq!(drain(&set), (0..130).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_setters_are_all_observed() {
        let set = Arc::new(AtomicFlagSet::new());
        let flags: Vec<_> = (0..8).map(|i| Arc::new(set.add_flag(i))).collect();
        let mut joins = Vec::new();
        for flag in &flags {
            let flag = Arc::clone(flag);
            joins.push(thread::spawn(move || {
                for _ in 0..1000 {
                    flag.set_active(true);
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(drain(&set), (0..8).collect::<Vec<_>>());
    }
}
