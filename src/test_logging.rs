//! Test logging infrastructure.
//!
//! Captures typed events for everything the scheduling core does during a
//! test (posts, runs, wake-ups, fences, reloads) with timestamps, so a
//! failing ordering test can print exactly what the manager decided and
//! when.
//!
//! # Overview
//!
//! - [`TestLogLevel`]: configurable verbosity, read from `TEST_LOG_LEVEL`
//! - [`TestEvent`]: typed events for the core's operations
//! - [`TestLogger`]: captures and reports events with timestamps
//!
//! The [`test_phase!`], [`test_section!`], [`assert_with_log!`] and
//! [`test_complete!`] macros structure a test's output; suites call
//! [`init_test_logging`] once per test.

use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Logging verbosity level for tests.
///
/// Levels are ordered from least to most verbose:
/// `Error < Warn < Info < Debug < Trace`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only errors and failures.
    Error,
    /// Warnings and above.
    Warn,
    /// General test progress.
    #[default]
    Info,
    /// Detailed queue operations.
    Debug,
    /// All events including selection decisions and wake-up reprogramming.
    Trace,
}

impl TestLogLevel {
    /// Returns a human-readable name for the level.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Returns the level from the `TEST_LOG_LEVEL` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

/// A typed event captured by the test logger.
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// A task was posted.
    TaskPosted {
        /// Queue name.
        queue: String,
        /// Requested delay.
        delay: Duration,
        /// Whether the post was accepted.
        accepted: bool,
    },
    /// A task started running.
    TaskStarted {
        /// Queue name.
        queue: String,
        /// Committed enqueue order.
        enqueue_order: u64,
    },
    /// A task finished running.
    TaskCompleted {
        /// Queue name.
        queue: String,
    },
    /// A queue's next wake-up changed.
    WakeUpChanged {
        /// Queue name.
        queue: String,
        /// New wake-up, milliseconds from the clock epoch; `None` when the
        /// queue has immediate work.
        wake_up_ms: Option<u64>,
    },
    /// A fence was installed.
    FenceInserted {
        /// Queue name.
        queue: String,
        /// The fence's enqueue order.
        fence: u64,
    },
    /// A fence was removed.
    FenceRemoved {
        /// Queue name.
        queue: String,
    },
    /// A queue was enabled or disabled.
    QueueEnabledChanged {
        /// Queue name.
        queue: String,
        /// New state.
        enabled: bool,
    },
    /// Custom event for test-specific logging.
    Custom {
        /// Category for filtering.
        category: &'static str,
        /// Human-readable message.
        message: String,
    },
    /// Error event.
    Error {
        /// Error category.
        category: &'static str,
        /// Error message.
        message: String,
    },
}

impl TestEvent {
    /// Returns the minimum log level required to display this event.
    #[must_use]
    pub fn level(&self) -> TestLogLevel {
        match self {
            Self::Error { .. } => TestLogLevel::Error,
            Self::TaskPosted { .. } | Self::TaskStarted { .. } | Self::TaskCompleted { .. } => {
                TestLogLevel::Debug
            }
            Self::WakeUpChanged { .. } => TestLogLevel::Trace,
            Self::FenceInserted { .. }
            | Self::FenceRemoved { .. }
            | Self::QueueEnabledChanged { .. }
            | Self::Custom { .. } => TestLogLevel::Info,
        }
    }
}

impl std::fmt::Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskPosted {
                queue,
                delay,
                accepted,
            } => write!(
                f,
                "task posted: queue={queue} delay={delay:?} accepted={accepted}"
            ),
            Self::TaskStarted {
                queue,
                enqueue_order,
            } => write!(f, "task started: queue={queue} order={enqueue_order}"),
            Self::TaskCompleted { queue } => write!(f, "task completed: queue={queue}"),
            Self::WakeUpChanged { queue, wake_up_ms } => match wake_up_ms {
                Some(ms) => write!(f, "wake-up changed: queue={queue} at={ms}ms"),
                None => write!(f, "wake-up changed: queue={queue} immediate"),
            },
            Self::FenceInserted { queue, fence } => {
                write!(f, "fence inserted: queue={queue} fence={fence}")
            }
            Self::FenceRemoved { queue } => write!(f, "fence removed: queue={queue}"),
            Self::QueueEnabledChanged { queue, enabled } => {
                write!(f, "queue enabled: queue={queue} enabled={enabled}")
            }
            Self::Custom { category, message } => write!(f, "{category}: {message}"),
            Self::Error { category, message } => write!(f, "ERROR {category}: {message}"),
        }
    }
}

/// Captures timed events and renders a report on demand.
#[derive(Debug)]
pub struct TestLogger {
    level: TestLogLevel,
    start: Instant,
    events: Mutex<Vec<(Duration, TestEvent)>>,
}

impl TestLogger {
    /// Creates a logger at the given verbosity.
    #[must_use]
    pub fn new(level: TestLogLevel) -> Self {
        Self {
            level,
            start: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Records an event if its level is enabled.
    pub fn log(&self, event: TestEvent) {
        if event.level() > self.level {
            return;
        }
        self.events.lock().push((self.start.elapsed(), event));
    }

    /// Number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Renders all captured events, one line per event.
    #[must_use]
    pub fn report(&self) -> String {
        let events = self.events.lock();
        let mut out = String::new();
        for (elapsed, event) in events.iter() {
            let _ = writeln!(out, "[{:>9.3}ms] {event}", elapsed.as_secs_f64() * 1_000.0);
        }
        out
    }

    /// Drops all captured events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for TestLogger {
    fn default() -> Self {
        Self::new(TestLogLevel::from_env())
    }
}

/// One-time test logging setup. Safe to call from every test.
pub fn init_test_logging() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        // Nothing global to install today; the hook exists so suites share
        // one call site if a subscriber is ever needed.
    });
}

/// Marks the beginning of a named test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        eprintln!("=== test: {} ===", $name);
    };
}

/// Marks a named section within a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        eprintln!("--- {} ---", $name);
    };
}

/// Asserts a condition, printing expected/actual values on failure.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $what:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            panic!(
                "assertion failed: {}\n  expected: {:?}\n  actual:   {:?}",
                $what, $expected, $actual
            );
        }
    };
}

/// Marks the successful end of a named test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        eprintln!("=== complete: {} ===", $name);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filtering() {
        let logger = TestLogger::new(TestLogLevel::Info);
        logger.log(TestEvent::TaskPosted {
            queue: "q".into(),
            delay: Duration::ZERO,
            accepted: true,
        });
        assert!(logger.is_empty(), "debug event filtered at info level");
        logger.log(TestEvent::FenceRemoved { queue: "q".into() });
        assert_eq!(logger.len(), 1);
    }

    #[test]
    fn report_renders_events() {
        let logger = TestLogger::new(TestLogLevel::Trace);
        logger.log(TestEvent::TaskStarted {
            queue: "io".into(),
            enqueue_order: 7,
        });
        logger.log(TestEvent::WakeUpChanged {
            queue: "io".into(),
            wake_up_ms: Some(30),
        });
        let report = logger.report();
        assert!(report.contains("task started: queue=io order=7"));
        assert!(report.contains("wake-up changed: queue=io at=30ms"));
    }

    #[test]
    fn levels_parse_from_env_format() {
        assert_eq!("trace".parse::<TestLogLevel>(), Ok(TestLogLevel::Trace));
        assert_eq!("WARN".parse::<TestLogLevel>().unwrap(), TestLogLevel::Warn);
        assert!("loud".parse::<TestLogLevel>().is_err());
    }
}
