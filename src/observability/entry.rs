//! Structured log entries.
//!
//! Log entries combine a message, severity level, timestamp, and structured
//! key-value fields for rich, queryable logging.

use super::level::LogLevel;
use crate::time::TimeTicks;
use crate::types::QueueId;
use core::fmt;

/// Maximum number of fields in a log entry (to bound memory).
const MAX_FIELDS: usize = 16;

/// A structured log entry with message, level, and contextual fields.
///
/// Entries about one task queue carry its [`QueueId`], so the collector can
/// slice out a single queue's lifecycle history.
///
/// # Example
///
/// ```
/// use sequent::observability::LogEntry;
///
/// let entry = LogEntry::info("fence removed")
///     .with_field("unblocked", "true")
///     .with_field("pending_tasks", "2");
/// assert_eq!(entry.fields().len(), 2);
/// ```
#[derive(Clone)]
pub struct LogEntry {
    level: LogLevel,
    message: String,
    timestamp: TimeTicks,
    queue: Option<QueueId>,
    fields: Vec<(String, String)>,
    target: Option<String>,
}

impl LogEntry {
    /// Creates a new log entry with the given level and message.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: TimeTicks::ZERO,
            queue: None,
            fields: Vec::new(),
            target: None,
        }
    }

    /// Creates a TRACE level entry.
    #[must_use]
    pub fn trace(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Trace, message)
    }

    /// Creates a DEBUG level entry.
    #[must_use]
    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    /// Creates an INFO level entry.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    /// Creates a WARN level entry.
    #[must_use]
    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    /// Creates an ERROR level entry.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    /// Adds a structured field. Fields past the cap are ignored.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if self.fields.len() < MAX_FIELDS {
            self.fields.push((key.into(), value.into()));
        }
        self
    }

    /// Tags the entry with the task queue it is about.
    #[must_use]
    pub fn for_queue(mut self, queue: QueueId) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: TimeTicks) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the target/module name.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Returns the log level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    /// Returns the log message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> TimeTicks {
        self.timestamp
    }

    /// Returns the tagged task queue, if any.
    #[must_use]
    pub const fn queue(&self) -> Option<QueueId> {
        self.queue
    }

    /// Returns the structured fields.
    #[must_use]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Returns the value of a field by key, if present.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the target, if set.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level.as_char(), self.message)?;
        if let Some(queue) = self.queue {
            write!(f, " queue={queue}")?;
        }
        for (key, value) in &self.fields {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntry")
            .field("level", &self.level)
            .field("message", &self.message)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let entry = LogEntry::warn("fence still active")
            .for_queue(QueueId(1))
            .with_field("fence", "12")
            .with_timestamp(TimeTicks::from_millis(5))
            .with_target("sequent::manager");
        assert_eq!(entry.level(), LogLevel::Warn);
        assert_eq!(entry.queue(), Some(QueueId(1)));
        assert_eq!(entry.field("fence"), Some("12"));
        assert_eq!(entry.field("missing"), None);
        assert_eq!(entry.timestamp(), TimeTicks::from_millis(5));
        assert_eq!(entry.target(), Some("sequent::manager"));
    }

    #[test]
    fn untagged_entry_has_no_queue() {
        let entry = LogEntry::info("sequence manager shut down");
        assert_eq!(entry.queue(), None);
    }

    #[test]
    fn field_cap_is_enforced() {
        let mut entry = LogEntry::info("spam");
        for i in 0..40 {
            entry = entry.with_field(format!("k{i}"), "v");
        }
        assert_eq!(entry.fields().len(), 16);
    }

    #[test]
    fn display_includes_queue_and_fields() {
        let entry = LogEntry::info("task queue created")
            .for_queue(QueueId(4))
            .with_field("name", "io");
        assert_eq!(entry.to_string(), "[I] task queue created queue=q4 name=io");
    }
}
