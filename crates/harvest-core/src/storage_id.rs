//! Storage Ids
//!
//! Row keys for append-log entries must sort newest-first and must practically never
//! collide between workers. A [`StorageId`] has two components:
//!
//! ```text
//!   09223371036854775807-3f2a9c...   (descending ticks)-(random unique id)
//! ```
//!
//! The descending component is `i64::MAX - ticks`, zero-padded to 20 digits so that
//! lexicographic order equals numeric order. Ticks are 100ns units since the Unix epoch.
//!
//! [`StorageIdGenerator`] additionally guarantees that ids produced by one process are
//! strictly decreasing, even when the clock does not advance between two calls.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

const NANOS_PER_TICK: i64 = 100;

/// A descending time-ordered id with a unique suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId {
    pub sequential: String,
    pub unique: String,
}

impl StorageId {
    pub fn new(sequential: impl Into<String>, unique: impl Into<String>) -> Self {
        Self {
            sequential: sequential.into(),
            unique: unique.into(),
        }
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.sequential, self.unique)
    }
}

/// Ticks (100ns units) since the Unix epoch.
fn ticks(timestamp: DateTime<Utc>) -> i64 {
    let seconds = timestamp.timestamp();
    let sub = i64::from(timestamp.timestamp_subsec_nanos()) / NANOS_PER_TICK;
    seconds.saturating_mul(10_000_000).saturating_add(sub)
}

fn format_descending(ticks: i64) -> String {
    format!("{:020}", i64::MAX - ticks)
}

/// Descending id component for a timestamp. Later timestamps produce smaller strings.
pub fn descending_id(timestamp: DateTime<Utc>) -> String {
    format_descending(ticks(timestamp))
}

/// Random unique id (32 lowercase hex characters).
pub fn unique_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Process-wide generator of strictly decreasing [`StorageId`]s.
#[derive(Debug, Default)]
pub struct StorageIdGenerator {
    last_ticks: AtomicI64,
}

impl StorageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next id. Never returns the same descending component twice.
    pub fn next_id(&self) -> StorageId {
        let now = ticks(Utc::now());
        let mut last = self.last_ticks.load(Ordering::Relaxed);
        let chosen = loop {
            let candidate = if now > last { now } else { last + 1 };
            match self.last_ticks.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(actual) => last = actual,
            }
        };

        StorageId::new(format_descending(chosen), unique_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_descending_id_is_padded() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(descending_id(epoch), "09223372036854775807");
        assert_eq!(descending_id(epoch).len(), 20);
    }

    #[test]
    fn test_later_timestamps_sort_first() {
        let earlier = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let later = Utc.timestamp_opt(1_600_000_000, 100).unwrap();
        assert!(descending_id(later) < descending_id(earlier));
    }

    #[test]
    fn test_generator_strictly_decreasing() {
        let generator = StorageIdGenerator::new();
        let ids: Vec<_> = (0..1000).map(|_| generator.next_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[1].sequential < pair[0].sequential);
            assert!(pair[1].to_string() < pair[0].to_string());
        }
    }

    #[test]
    fn test_display_format() {
        let id = StorageId::new("00000000000000000001", "abc");
        assert_eq!(id.to_string(), "00000000000000000001-abc");
        assert_eq!(unique_id().len(), 32);
    }
}
