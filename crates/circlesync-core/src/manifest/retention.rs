//! Retention window filtering

use crate::types::{Action, ManifestEntry, Post, Reaction, Timestamp};

/// Default retention window in days
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Anything with a creation time
pub trait Timestamped {
    /// Creation time (ms)
    fn timestamp(&self) -> Timestamp;
}

impl Timestamped for ManifestEntry {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Timestamped for Post {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Timestamped for Reaction {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Timestamped for Action {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl<T: Timestamped> Timestamped for &T {
    fn timestamp(&self) -> Timestamp {
        (*self).timestamp()
    }
}

/// Keep entries with `timestamp >= now - window_ms`, preserving order.
///
/// Filtering twice gives the same result as filtering once, and a narrower
/// window returns a subset of a wider one.
pub fn filter_by_retention<T, I>(entries: I, now: Timestamp, window_ms: i64) -> Vec<T>
where
    T: Timestamped,
    I: IntoIterator<Item = T>,
{
    let cutoff = now.saturating_sub(window_ms);
    entries
        .into_iter()
        .filter(|e| e.timestamp() >= cutoff)
        .collect()
}
