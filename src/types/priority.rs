//! Queue priority bands.

use core::fmt;

/// The priority band of a task queue.
///
/// Bands are totally ordered, most important first. Within a band, selection
/// is by enqueue order; across bands, the more important band always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QueuePriority {
    /// For control messages that must preempt everything else.
    Control = 0,
    /// The most important band for ordinary work.
    Highest = 1,
    /// Above high, below highest.
    VeryHigh = 2,
    /// More important than normal work.
    High = 3,
    /// The default band.
    #[default]
    Normal = 4,
    /// Less important than normal work.
    Low = 5,
    /// Runs only when nothing else is ready.
    BestEffort = 6,
}

impl QueuePriority {
    /// Number of priority bands.
    pub const COUNT: usize = 7;

    /// All bands, most important first.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Control,
        Self::Highest,
        Self::VeryHigh,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::BestEffort,
    ];

    /// Returns the band index (0 = most important).
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns true if this band is at least as important as `Normal`.
    #[must_use]
    pub const fn is_normal_or_more_important(self) -> bool {
        (self as u8) <= (Self::Normal as u8)
    }

    /// Returns a stable lowercase name for tracing.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Highest => "highest",
            Self::VeryHigh => "very_high",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::BestEffort => "best_effort",
        }
    }

    /// Returns the band for an index, if valid.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }
}

impl fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_are_ordered_most_important_first() {
        let mut previous = None;
        for band in QueuePriority::ALL {
            if let Some(prev) = previous {
                assert!(prev < band, "{prev} should order before {band}");
            }
            previous = Some(band);
        }
    }

    #[test]
    fn normal_threshold() {
        assert!(QueuePriority::Control.is_normal_or_more_important());
        assert!(QueuePriority::Normal.is_normal_or_more_important());
        assert!(!QueuePriority::Low.is_normal_or_more_important());
        assert!(!QueuePriority::BestEffort.is_normal_or_more_important());
    }

    #[test]
    fn index_round_trips() {
        for band in QueuePriority::ALL {
            assert_eq!(QueuePriority::from_index(band.index()), Some(band));
        }
        assert_eq!(QueuePriority::from_index(7), None);
    }
}
