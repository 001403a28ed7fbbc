//! The enqueue-order total order.
//!
//! Every task committed to a work queue carries an [`EnqueueOrder`]: a 64-bit
//! value allocated monotonically by the sequence manager. Enqueue orders are
//! globally unique across all queues of one manager, so they double as the
//! tie-free comparison key for cross-queue selection and for fences.

use core::fmt;

/// A monotonically-increasing sequence value that totally orders tasks.
///
/// Two values are distinguished:
///
/// - [`EnqueueOrder::NONE`] (0): the task has not been committed to a work
///   queue yet.
/// - [`EnqueueOrder::BLOCKING_FENCE`] (1): a fence value below every real
///   order, used to block a queue entirely.
///
/// Regular orders start at [`EnqueueOrder::FIRST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct EnqueueOrder(u64);

impl EnqueueOrder {
    /// The "unassigned" value.
    pub const NONE: Self = Self(0);
    /// A fence that blocks everything except tasks ordered below it
    /// (i.e. nothing, since real orders start above).
    pub const BLOCKING_FENCE: Self = Self(1);
    /// The first order the allocator hands out.
    pub const FIRST: Self = Self(2);
    /// The largest representable order.
    pub const MAX: Self = Self(u64::MAX);

    /// Wraps a raw value. Callers are expected to pass values previously
    /// produced by the manager's allocator.
    #[must_use]
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true for any value other than [`EnqueueOrder::NONE`].
    #[must_use]
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EnqueueOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
