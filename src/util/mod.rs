//! Internal utilities.

pub(crate) mod atomic_flag_set;

pub(crate) use atomic_flag_set::{AtomicFlag, AtomicFlagSet};
