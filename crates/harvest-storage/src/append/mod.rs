//! Append Log and Compaction
//!
//! Many workers append batches of typed records; a compaction pass later folds all
//! pending batches of a bucket into one CSV blob.
//!
//! ## Layout
//!
//! ```text
//! Log table (wide entities)
//! ┌───────────────┬────────────────────────────┬───────────────────────────┐
//! │ partition     │ row key                    │ content                   │
//! ├───────────────┼────────────────────────────┼───────────────────────────┤
//! │ "2"           │ "0922337..-9f1c.." (newest)│ MessagePack [record, ...] │
//! │ "2"           │ "0922337..-03ab.."         │ MessagePack [record, ...] │
//! │ "7"           │ "0922337..-77de.."         │ MessagePack [record, ...] │
//! │ ""            │ "2"                        │ (empty marker)            │
//! │ ""            │ "7"                        │ (empty marker)            │
//! └───────────────┴────────────────────────────┴───────────────────────────┘
//!
//! Object store
//!   {container}/compact_2.csv.gz   header line + rows, gzip
//!   {container}/compact_7.csv.gz
//! ```
//!
//! ## Append
//!
//! 1. Group records by `get_bucket(bucket_count, record.bucket_key())`
//! 2. Write each group as a new log entity under a descending time id
//! 3. Make sure the bucket's marker exists (data is always written first)
//!
//! A group too large for one entity is halved recursively.
//!
//! ## Compaction
//!
//! 1. Read the bucket's log entities, newest first
//! 2. Append the records of the current compacted blob, if any
//! 3. Prune, check record keys are unique, render CSV
//! 4. Skip the write when the content hash matches the stored blob
//! 5. Otherwise write conditionally: must-not-exist, or must-match the read version
//!
//! Two compactions racing on one bucket cannot both win step 5; the loser gets
//! `BlobConflict` and must rerun.

mod csv_blob;
mod header_cache;
mod record;
mod service;

pub use header_cache::HeaderCache;
pub use record::CsvRecord;
pub use service::{AppendResultStorageService, MARKER_PARTITION_KEY};

/// Result of one compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Nothing was pending and the pass was not forced.
    Skipped,
    /// The merged content equals the stored blob; nothing was written.
    Unchanged(CompactionStats),
    /// A new blob version was written.
    Written(CompactionStats),
}

impl CompactionOutcome {
    pub fn stats(&self) -> Option<&CompactionStats> {
        match self {
            CompactionOutcome::Skipped => None,
            CompactionOutcome::Unchanged(stats) | CompactionOutcome::Written(stats) => Some(stats),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CompactionOutcome::Skipped => "skipped",
            CompactionOutcome::Unchanged(_) => "unchanged",
            CompactionOutcome::Written(_) => "written",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    /// Records read from the log.
    pub new_records: usize,
    /// Records read from the previous blob.
    pub existing_records: usize,
    /// Records left after pruning.
    pub final_records: usize,
    pub uncompressed_size: usize,
    /// Size as stored, equal to `uncompressed_size` without gzip.
    pub compressed_size: usize,
    /// Version token of the blob now stored.
    pub version: Option<String>,
}

/// Records of a compacted blob, or the absence of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactedRead<T> {
    Found(Vec<T>),
    NotFound,
}

impl<T> CompactedRead<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, CompactedRead::Found(_))
    }

    /// The records, empty when there is no blob.
    pub fn into_records(self) -> Vec<T> {
        match self {
            CompactedRead::Found(records) => records,
            CompactedRead::NotFound => Vec::new(),
        }
    }
}
