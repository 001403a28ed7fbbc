//! Core types for the sequencing core.
//!
//! This module contains the fundamental types used throughout the crate:
//!
//! - [`order`]: the [`EnqueueOrder`] total order over posted tasks
//! - [`priority`]: the [`QueuePriority`] band lattice
//! - [`QueueId`]: the per-manager task queue identifier

pub mod order;
pub mod priority;

pub use order::EnqueueOrder;
pub use priority::QueuePriority;

use core::fmt;

/// Identifies a task queue within one sequence manager.
///
/// Ids are allocated sequentially at queue creation and never reused for the
/// lifetime of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct QueueId(pub(crate) u64);

impl QueueId {
    /// Returns the raw numeric id.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_id_display() {
        assert_eq!(QueueId(7).to_string(), "q7");
        assert_eq!(QueueId(7).value(), 7);
    }
}
