//! Structured logging for the sequencing core.
//!
//! The manager records queue lifecycle transitions (creation,
//! unregistration, shutdown) as queue-tagged [`LogEntry`] values in a
//! bounded [`LogCollector`]; embedders drain it into their own sink or
//! slice a single queue's history. Entries below the collector's minimum
//! level bypass the buffer lock entirely and only bump a suppression
//! counter.

pub mod collector;
pub mod entry;
pub mod level;

pub use collector::LogCollector;
pub use entry::LogEntry;
pub use level::LogLevel;
