//! Harvest Core
//!
//! Building blocks shared by the table and storage crates:
//!
//! - [`ChunkStream`]: a seekable, read-only view over an ordered list of byte chunks
//! - [`StorageId`] / [`StorageIdGenerator`]: descending, time-ordered row keys
//! - [`get_bucket`]: stable hash bucketing of record keys

pub mod bucket;
pub mod chunk_stream;
pub mod error;
pub mod storage_id;

pub use bucket::get_bucket;
pub use chunk_stream::ChunkStream;
pub use error::{Error, Result};
pub use storage_id::{descending_id, unique_id, StorageId, StorageIdGenerator};
