//! Logging severity levels.

use core::fmt;
use std::str::FromStr;

/// Severity level for log entries.
///
/// Levels are ordered: Trace < Debug < Info < Warn < Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Detailed tracing information (lowest priority).
    Trace,
    /// Debugging information.
    Debug,
    /// General informational messages (default).
    Info,
    /// Warning conditions that are not errors.
    Warn,
    /// Error conditions (highest priority).
    Error,
}

impl LogLevel {
    /// Returns true if this level is enabled given the threshold.
    #[must_use]
    pub const fn is_enabled_at(&self, threshold: Self) -> bool {
        (*self as u8) >= (threshold as u8)
    }

    /// Returns a single-character representation (T, D, I, W, E).
    #[must_use]
    pub const fn as_char(&self) -> char {
        match self {
            Self::Trace => 'T',
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
        }
    }

    /// Returns the uppercase name of the level.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_filtering() {
        assert!(LogLevel::Error.is_enabled_at(LogLevel::Info));
        assert!(LogLevel::Info.is_enabled_at(LogLevel::Info));
        assert!(!LogLevel::Debug.is_enabled_at(LogLevel::Info));
        assert!(LogLevel::Trace.is_enabled_at(LogLevel::Trace));
    }

    #[test]
    fn parse_round_trip() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(level.name().parse::<LogLevel>(), Ok(level));
        }
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("noisy".parse::<LogLevel>().is_err());
    }
}
