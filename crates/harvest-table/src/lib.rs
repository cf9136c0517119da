//! Harvest Table Store
//!
//! This crate defines the boundary to the remote key-value table backend that wide
//! entities and the append log are stored in.
//!
//! ## Purpose
//!
//! The backend is a partitioned table service with a narrow contract:
//! - **Rows** are addressed by `(partition_key, row_key)` and carry typed properties
//! - **Transactions** apply up to 100 actions atomically, all within one partition
//! - **Conditional writes** use etags (`If-Match`) for optimistic concurrency
//! - **Hard limits** cap entity size, binary property size and request body size
//! - **Queries** return rows sorted by key, one page at a time
//!
//! Everything above this crate (segmenting, batch splitting, log compaction) is written
//! against the [`TableStore`] trait only.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────┐
//! │   WideEntityService    │
//! └───────────┬────────────┘
//!             │ TableStore
//!             ▼
//! ┌────────────────────────┐
//! │   RetryingTableStore   │ ◄── transient retries, no-op retry detection
//! └───────────┬────────────┘
//!             │ TableStore
//!             ▼
//! ┌────────────────────────┐
//! │ InMemoryTableStore /   │
//! │ remote table client    │
//! └────────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use harvest_table::{InMemoryTableStore, RetryingTableStore, TableStore, TableAction, TableRow};
//!
//! let store = RetryingTableStore::new(InMemoryTableStore::new(), RetryConfig::default());
//! store.create_table("log").await?;
//!
//! let etags = store
//!     .submit_transaction("log", vec![TableAction::Add(TableRow::new("0", "a"))])
//!     .await?;
//! ```
//!
//! ## Thread Safety
//!
//! All implementations are Send + Sync and are shared across tasks via `Arc<dyn TableStore>`.

pub mod config;
pub mod error;
pub mod memory;
pub mod retry;
pub mod size;
pub mod types;

pub use config::{RetryConfig, TableLimits};
pub use error::{Result, TableError};
pub use memory::InMemoryTableStore;
pub use retry::{RetryingTableStore, CLIENT_REQUEST_ID_LEN, CLIENT_REQUEST_ID_PROPERTY};
pub use size::{entity_size, request_size, EntitySizeCalculator};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Table backend trait - abstracts over the remote table service.
///
/// ## Implementations
///
/// - **InMemoryTableStore**: process-local backend enforcing the same limits as the
///   remote service; used in tests and single-process tools
/// - **RetryingTableStore**: decorator adding transient-failure retries to any backend
///
/// ## Error Handling
///
/// All methods return `Result<T>` which is `Result<T, TableError>`. A failed
/// transaction never leaves partial writes behind.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create a table. Creating an existing table is a no-op.
    async fn create_table(&self, table: &str) -> Result<()>;

    /// Delete a table and all of its rows. Deleting a missing table is a no-op.
    async fn delete_table(&self, table: &str) -> Result<()>;

    /// Fetch one page of rows matching `query`.
    ///
    /// Rows are sorted by `(partition_key, row_key)`. When more matching rows remain,
    /// `QueryPage::continuation` holds the position to resume from.
    ///
    /// # Errors
    ///
    /// - `TableNotFound`: the table does not exist
    /// - `InvalidInput`: `max_per_page` is zero
    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
        max_per_page: usize,
    ) -> Result<QueryPage>;

    /// Apply `actions` atomically.
    ///
    /// All actions must share one partition key and target distinct row keys. Returns
    /// the new etag of every written row, in action order (`None` for deletes).
    ///
    /// # Errors
    ///
    /// - `EntityAlreadyExists`, `EntityNotFound`, `PreconditionFailed`: logical conflicts
    /// - `EntityTooLarge`, `RequestBodyTooLarge`: limits exceeded, nothing applied
    /// - `InvalidInput`: empty, mixed-partition or oversized transaction
    /// - `Transient`: the outcome is unknown and the request may be retried
    async fn submit_transaction(
        &self,
        table: &str,
        actions: Vec<TableAction>,
    ) -> Result<Vec<Option<String>>>;

    /// Drain every page of `query`.
    async fn query_all(
        &self,
        table: &str,
        query: &TableQuery,
        max_per_page: usize,
    ) -> Result<Vec<TableRow>> {
        let mut rows = Vec::new();
        let mut continuation: Option<ContinuationToken> = None;
        loop {
            let page = self
                .query_page(table, query, continuation.as_ref(), max_per_page)
                .await?;
            rows.extend(page.rows);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(rows),
            }
        }
    }
}

#[async_trait]
impl<T: TableStore + ?Sized> TableStore for Arc<T> {
    async fn create_table(&self, table: &str) -> Result<()> {
        (**self).create_table(table).await
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        (**self).delete_table(table).await
    }

    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
        max_per_page: usize,
    ) -> Result<QueryPage> {
        (**self)
            .query_page(table, query, continuation, max_per_page)
            .await
    }

    async fn submit_transaction(
        &self,
        table: &str,
        actions: Vec<TableAction>,
    ) -> Result<Vec<Option<String>>> {
        (**self).submit_transaction(table, actions).await
    }
}
