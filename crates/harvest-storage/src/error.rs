//! Storage Error Types
//!
//! This module defines all error types that can occur in the wide entity and
//! append/compaction services.
//!
//! ## Error Categories
//!
//! Every error maps to an [`ErrorKind`] so orchestration code can decide between
//! retrying the whole operation and aborting:
//!
//! ### Capacity
//! - `ContentTooLarge`: a payload exceeds the wide entity size ceiling
//! - `RequestTooLarge`: a batch cannot be made to fit a backend transaction
//!
//! ### Concurrency
//! - `AlreadyExists`, `NotFound`, `PreconditionFailed`: table row version conflicts
//! - `BlobConflict`: a conditional write of a compacted blob lost a race
//!
//! ### Transient
//! - `Table` errors the transport layer gave up retrying
//! - `ObjectStore` generic and join errors (other object store errors are `Other`,
//!   except conditional write failures, which are concurrency errors)
//!
//! ### Invariant
//! - `InvariantViolation`: stored segments disagree with their own segment count
//! - `HeaderMismatch`: a compacted blob was written for a different record schema
//! - `DuplicateRecords`: pruning left more than one record per key
//! - `Serialization`: a stored log entity could not be decoded
//!
//! ### Cancelled
//! - `Cancelled`: the caller's cancellation token fired before a backend request
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows clean error propagation with `?`.

use harvest_table::TableError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Capacity,
    Concurrency,
    Transient,
    Invariant,
    Cancelled,
    Other,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Content too large: {size} bytes, limit {limit}")]
    ContentTooLarge { size: usize, limit: usize },

    #[error("Request too large: {0}")]
    RequestTooLarge(String),

    #[error("Entity already exists: {partition_key}/{row_key}")]
    AlreadyExists {
        partition_key: String,
        row_key: String,
    },

    #[error("Entity not found: {partition_key}/{row_key}")]
    NotFound {
        partition_key: String,
        row_key: String,
    },

    #[error("Precondition failed for {partition_key}/{row_key}: expected {expected}, actual {actual}")]
    PreconditionFailed {
        partition_key: String,
        row_key: String,
        expected: String,
        actual: String,
    },

    #[error("Conditional write of blob {path} was rejected: {source}")]
    BlobConflict {
        path: String,
        #[source]
        source: object_store::Error,
    },

    #[error("Table error: {0}")]
    Table(TableError),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Header mismatch: expected '{expected}', found '{actual}'")]
    HeaderMismatch { expected: String, actual: String },

    #[error("{count} duplicate record keys remain after pruning, e.g. {sample:?}")]
    DuplicateRecords { count: usize, sample: Vec<String> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("A CSV row of {row_bytes} bytes does not fit the maximum buffer of {max} bytes")]
    BufferTooSmall { row_bytes: usize, max: usize },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The entity was retrieved without its data")]
    DataNotIncluded,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ContentTooLarge { .. } | Error::RequestTooLarge(_) => ErrorKind::Capacity,
            Error::AlreadyExists { .. }
            | Error::NotFound { .. }
            | Error::PreconditionFailed { .. }
            | Error::BlobConflict { .. } => ErrorKind::Concurrency,
            Error::Table(e) if e.is_transient() => ErrorKind::Transient,
            Error::Table(e) if e.is_capacity() => ErrorKind::Capacity,
            Error::Table(_) => ErrorKind::Other,
            Error::ObjectStore(e) => object_store_kind(e),
            Error::InvariantViolation(_)
            | Error::HeaderMismatch { .. }
            | Error::DuplicateRecords { .. }
            | Error::Serialization(_) => ErrorKind::Invariant,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::BufferTooSmall { .. }
            | Error::Csv(_)
            | Error::Io(_)
            | Error::DataNotIncluded
            | Error::InvalidArgument(_) => ErrorKind::Other,
        }
    }

    /// Whether re-running the whole operation (after re-reading state) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Concurrency | ErrorKind::Transient)
    }
}

/// Generic store failures and join errors are transient; the rest are permanent.
fn object_store_kind(e: &object_store::Error) -> ErrorKind {
    match e {
        object_store::Error::Generic { .. } | object_store::Error::JoinError { .. } => {
            ErrorKind::Transient
        }
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            ErrorKind::Concurrency
        }
        _ => ErrorKind::Other,
    }
}

impl From<TableError> for Error {
    fn from(e: TableError) -> Self {
        match e {
            TableError::EntityAlreadyExists {
                partition_key,
                row_key,
            } => Error::AlreadyExists {
                partition_key,
                row_key,
            },
            TableError::EntityNotFound {
                partition_key,
                row_key,
            } => Error::NotFound {
                partition_key,
                row_key,
            },
            TableError::PreconditionFailed {
                partition_key,
                row_key,
                expected,
                actual,
            } => Error::PreconditionFailed {
                partition_key,
                row_key,
                expected,
                actual,
            },
            other => Error::Table(other),
        }
    }
}

impl From<harvest_core::Error> for Error {
    fn from(e: harvest_core::Error) -> Self {
        match e {
            harvest_core::Error::Io(io) => Error::Io(io),
            other => Error::InvalidArgument(other.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
