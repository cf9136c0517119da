//! Error Types for Harvest Core
//!
//! ## Error Categories
//!
//! ### Caller Errors
//! - `BufferOverrun`: an `offset`/`count` pair does not fit in the destination buffer
//! - `PositionOutOfRange`: a seek target lies outside `[0, length]`
//! - `InvalidBucketCount`: bucketing was asked to spread keys over zero buckets
//!
//! ### I/O Errors
//! - `Io`: wrapped `std::io::Error` from reader/writer adapters
//!
//! All functions in this crate return `Result<T>`, aliased to `Result<T, Error>`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer overrun: offset {offset} + count {count} exceeds buffer length {buffer_len}")]
    BufferOverrun {
        offset: usize,
        count: usize,
        buffer_len: usize,
    },

    #[error("Position {position} is outside of stream length {length}")]
    PositionOutOfRange { position: u64, length: u64 },

    #[error("Bucket count must be greater than zero")]
    InvalidBucketCount,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidInput, other),
        }
    }
}
