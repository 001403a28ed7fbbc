//! In-memory store of scheduler lifecycle logs.
//!
//! The sequence manager appends an entry whenever a queue is created,
//! unregistered, or the manager shuts down; embedders drain the buffer into
//! their own sink, or slice one queue's history when diagnosing a stall.
//! The buffer is bounded: once full, the oldest entries are evicted and an
//! eviction counter records how many a drained report is missing. Entries
//! below the minimum level never take the lock; they only bump an atomic
//! suppression counter.

use super::entry::LogEntry;
use super::level::LogLevel;
use crate::types::QueueId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded store of scheduler log entries, sliceable per queue.
#[derive(Debug)]
pub struct LogCollector {
    min_level: LogLevel,
    suppressed: AtomicU64,
    state: Mutex<CollectorState>,
}

#[derive(Debug)]
struct CollectorState {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    evicted: u64,
}

impl LogCollector {
    /// Creates a collector holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            min_level: LogLevel::Info,
            suppressed: AtomicU64::new(0),
            state: Mutex::new(CollectorState {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                evicted: 0,
            }),
        }
    }

    /// Sets the minimum level recorded; everything below it is counted as
    /// suppressed instead of stored.
    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Records an entry, evicting the oldest one if the buffer is full.
    pub fn log(&self, entry: LogEntry) {
        if !entry.level().is_enabled_at(self.min_level) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut state = self.state.lock();
        if state.entries.len() >= state.capacity {
            state.entries.pop_front();
            state.evicted += 1;
        }
        state.entries.push_back(entry);
    }

    /// Takes every stored entry, oldest first. Eviction and suppression
    /// counters keep accumulating across drains.
    #[must_use]
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut state = self.state.lock();
        state.entries.drain(..).collect()
    }

    /// The stored entries tagged for one queue, oldest first. Entries about
    /// the manager as a whole carry no tag and are not returned here.
    #[must_use]
    pub fn queue_history(&self, queue: QueueId) -> Vec<LogEntry> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|entry| entry.queue() == Some(queue))
            .cloned()
            .collect()
    }

    /// Entries lost to the ring since construction.
    #[must_use]
    pub fn evicted_count(&self) -> u64 {
        self.state.lock().evicted
    }

    /// Entries dropped for being below the minimum level.
    #[must_use]
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Number of entries currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_history_slices_one_queue() {
        let collector = LogCollector::new(8);
        collector.log(LogEntry::info("task queue created").for_queue(QueueId(1)));
        collector.log(LogEntry::info("task queue created").for_queue(QueueId(2)));
        collector.log(LogEntry::info("task queue unregistered").for_queue(QueueId(1)));
        collector.log(LogEntry::info("sequence manager shut down"));

        let history = collector.queue_history(QueueId(1));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message(), "task queue created");
        assert_eq!(history[1].message(), "task queue unregistered");
        assert!(collector.queue_history(QueueId(9)).is_empty());
    }

    #[test]
    fn eviction_is_counted_not_silent() {
        let collector = LogCollector::new(2);
        for i in 0..5 {
            collector.log(LogEntry::info(format!("entry {i}")));
        }
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.evicted_count(), 3);

        let drained = collector.drain();
        assert_eq!(drained[0].message(), "entry 3");
        assert_eq!(drained[1].message(), "entry 4");
        // The counter survives the drain.
        assert_eq!(collector.evicted_count(), 3);
    }

    #[test]
    fn below_level_entries_are_suppressed() {
        let collector = LogCollector::new(8).with_min_level(LogLevel::Warn);
        collector.log(LogEntry::debug("reload flag drained"));
        collector.log(LogEntry::info("task queue created").for_queue(QueueId(1)));
        collector.log(LogEntry::warn("fence held for a full drain"));

        assert_eq!(collector.len(), 1);
        assert_eq!(collector.suppressed_count(), 2);
        assert_eq!(collector.evicted_count(), 0);
    }

    #[test]
    fn drain_empties_but_keeps_collecting() {
        let collector = LogCollector::new(4);
        collector.log(LogEntry::info("one").for_queue(QueueId(3)));
        assert!(!collector.is_empty());
        assert_eq!(collector.drain().len(), 1);
        assert!(collector.is_empty());

        collector.log(LogEntry::info("two").for_queue(QueueId(3)));
        assert_eq!(collector.queue_history(QueueId(3)).len(), 1);
    }
}
