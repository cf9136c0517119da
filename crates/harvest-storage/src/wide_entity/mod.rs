//! Wide Entities
//!
//! A wide entity is an opaque byte payload stored under a `(partition_key, row_key)`
//! identity that may be far larger than one table row. The payload is cut into
//! segments, each stored as its own row, and all segments of one entity are written,
//! replaced and deleted in a single atomic transaction.
//!
//! ## Physical Layout
//!
//! ```text
//! Logical entity (pk="p", rk="report", 2.1 MB)
//!
//! ┌────────────────────────────────────────────────────────────────┐
//! │ row "report~00"  C=3  D..S: bytes [0, 960K)                    │
//! │ row "report~01"       D..S: bytes [960K, 1920K)                │
//! │ row "report~02"       D..N: bytes [1920K, 2.1M)                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Segment 0 carries the segment count (`C`) and its etag is the entity's etag
//! - Each binary property `D`..`S` holds at most 64 KiB
//! - An empty payload is stored as one segment without payload properties
//!
//! ## Concurrency
//!
//! Replace and delete are conditional on segment 0's etag, so a stale writer fails
//! with `PreconditionFailed` (or `NotFound` if the entity is gone) and never mixes
//! its segments with another writer's.

mod batch;
mod segment;
mod service;

pub use segment::segment_count;
pub use service::WideEntityService;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use harvest_core::ChunkStream;

use crate::error::{Error, Result};

/// A logical record assembled from its segment rows.
#[derive(Debug, Clone)]
pub struct WideEntity {
    partition_key: String,
    row_key: String,
    etag: String,
    timestamp: Option<DateTime<Utc>>,
    segment_count: usize,
    chunks: Option<Vec<Bytes>>,
}

impl WideEntity {
    pub(crate) fn new(
        partition_key: String,
        row_key: String,
        etag: String,
        timestamp: Option<DateTime<Utc>>,
        segment_count: usize,
        chunks: Option<Vec<Bytes>>,
    ) -> Self {
        Self {
            partition_key,
            row_key,
            etag,
            timestamp,
            segment_count,
            chunks,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// Version token of the whole entity.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn data_included(&self) -> bool {
        self.chunks.is_some()
    }

    /// Payload length, if the entity was retrieved with its data.
    pub fn data_len(&self) -> Option<usize> {
        self.chunks
            .as_ref()
            .map(|chunks| chunks.iter().map(Bytes::len).sum())
    }

    /// A fresh stream over the payload.
    ///
    /// # Errors
    ///
    /// `DataNotIncluded` if the entity was retrieved without data.
    pub fn stream(&self) -> Result<ChunkStream> {
        let chunks = self.chunks.as_ref().ok_or(Error::DataNotIncluded)?;
        Ok(ChunkStream::new(chunks.iter().cloned()))
    }

    /// The payload as one contiguous buffer. Copies unless it is a single chunk.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let chunks = self.chunks.as_ref().ok_or(Error::DataNotIncluded)?;
        match chunks.as_slice() {
            [] => Ok(Bytes::new()),
            [single] => Ok(single.clone()),
            many => {
                let mut buf = BytesMut::with_capacity(many.iter().map(Bytes::len).sum());
                for chunk in many {
                    buf.extend_from_slice(chunk);
                }
                Ok(buf.freeze())
            }
        }
    }
}

/// One mutation inside [`WideEntityService::execute_batch`].
#[derive(Debug, Clone)]
pub enum WideEntityOperation {
    /// Create a new entity; fails with `AlreadyExists` if the identity is taken.
    Insert {
        partition_key: String,
        row_key: String,
        content: Bytes,
    },
    /// Create or overwrite an entity unconditionally.
    InsertOrReplace {
        partition_key: String,
        row_key: String,
        content: Bytes,
    },
    /// Overwrite `existing` if it is unchanged since it was read.
    Replace { existing: WideEntity, content: Bytes },
    /// Remove `existing` if it is unchanged since it was read.
    Delete { existing: WideEntity },
}

impl WideEntityOperation {
    pub fn insert(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        WideEntityOperation::Insert {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            content: content.into(),
        }
    }

    pub fn insert_or_replace(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        WideEntityOperation::InsertOrReplace {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            content: content.into(),
        }
    }

    pub fn replace(existing: WideEntity, content: impl Into<Bytes>) -> Self {
        WideEntityOperation::Replace {
            existing,
            content: content.into(),
        }
    }

    pub fn delete(existing: WideEntity) -> Self {
        WideEntityOperation::Delete { existing }
    }

    pub fn partition_key(&self) -> &str {
        match self {
            WideEntityOperation::Insert { partition_key, .. }
            | WideEntityOperation::InsertOrReplace { partition_key, .. } => partition_key,
            WideEntityOperation::Replace { existing, .. }
            | WideEntityOperation::Delete { existing } => existing.partition_key(),
        }
    }

    pub fn row_key(&self) -> &str {
        match self {
            WideEntityOperation::Insert { row_key, .. }
            | WideEntityOperation::InsertOrReplace { row_key, .. } => row_key,
            WideEntityOperation::Replace { existing, .. }
            | WideEntityOperation::Delete { existing } => existing.row_key(),
        }
    }
}
