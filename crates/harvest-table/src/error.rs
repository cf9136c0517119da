//! Table Error Types
//!
//! This module defines all error types a table backend can report.
//!
//! ## Error Categories
//!
//! ### Concurrency Errors
//! - `EntityAlreadyExists`: an `Add` hit an occupied key
//! - `EntityNotFound`: an update or delete targeted a missing row
//! - `PreconditionFailed`: the row's etag did not match the `If-Match` value
//!
//! ### Capacity Errors
//! - `EntityTooLarge`: one row exceeds the per-entity size limit
//! - `RequestBodyTooLarge`: the encoded transaction exceeds the per-request limit
//!
//! ### Transient Errors
//! - `Transient`: timeouts, throttling and other failures worth retrying as-is
//!
//! ### Other
//! - `TableNotFound`, `InvalidInput`
//!
//! The whole transaction is rejected whenever any error is returned; partial writes
//! are never applied.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TableError>;

#[derive(Debug, Clone, Error)]
pub enum TableError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Entity already exists: {partition_key}/{row_key}")]
    EntityAlreadyExists {
        partition_key: String,
        row_key: String,
    },

    #[error("Entity not found: {partition_key}/{row_key}")]
    EntityNotFound {
        partition_key: String,
        row_key: String,
    },

    #[error("Precondition failed for {partition_key}/{row_key}: expected etag {expected}, actual {actual}")]
    PreconditionFailed {
        partition_key: String,
        row_key: String,
        expected: String,
        actual: String,
    },

    #[error("Entity too large: {partition_key}/{row_key} is {size} bytes, limit {limit}")]
    EntityTooLarge {
        partition_key: String,
        row_key: String,
        size: usize,
        limit: usize,
    },

    #[error("Request body too large: {size} bytes, limit {limit}")]
    RequestBodyTooLarge { size: usize, limit: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transient table failure: {0}")]
    Transient(String),
}

impl TableError {
    /// Worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, TableError::Transient(_))
    }

    /// A logical conflict with the current state of a row.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TableError::EntityAlreadyExists { .. }
                | TableError::EntityNotFound { .. }
                | TableError::PreconditionFailed { .. }
        )
    }

    /// The request could succeed if it were split into smaller pieces.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            TableError::EntityTooLarge { .. } | TableError::RequestBodyTooLarge { .. }
        )
    }

    /// Short label for metrics.
    pub fn outcome_label(&self) -> &'static str {
        if self.is_transient() {
            "transient"
        } else if self.is_conflict() {
            "conflict"
        } else if self.is_capacity() {
            "capacity"
        } else {
            "error"
        }
    }
}
