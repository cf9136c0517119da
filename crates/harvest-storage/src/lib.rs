//! Harvest Storage Layer
//!
//! This crate implements the durable storage layer every part of the harvesting
//! pipeline writes through: a wide entity store for payloads larger than one table
//! row, and a bucketed append log that is periodically compacted into CSV blobs.
//!
//! ## What is the Storage Layer?
//!
//! Catalog drivers produce byte payloads and batches of typed records. This crate
//! persists them without knowing what they mean:
//!
//! 1. **Wide entities**: payloads up to ~2.7 MB split over atomically written segment rows
//! 2. **Append**: records hashed into buckets and written as new log entities
//! 3. **Compaction**: pending appends merged with the previous snapshot, pruned, and
//!    written as one gzipped CSV blob per bucket under a conditional write
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────┐
//! │ Catalog drivers  │
//! └────────┬─────────┘
//!          │ records
//!          ▼
//! ┌────────────────────────────┐       ┌──────────────────────┐
//! │ AppendResultStorageService │──────►│ ObjectStore          │
//! │ - bucketing, markers       │ blobs │ compact_{n}.csv.gz   │
//! │ - compaction               │       └──────────────────────┘
//! └────────┬───────────────────┘
//!          │ wide entities
//!          ▼
//! ┌────────────────────────────┐
//! │ WideEntityService          │
//! │ - segmenting               │
//! │ - batch splitting          │
//! └────────┬───────────────────┘
//!          │ transactions
//!          ▼
//! ┌────────────────────────────┐
//! │ RetryingTableStore         │ ◄── transient retries
//! └────────┬───────────────────┘
//!          ▼
//!    table backend
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use harvest_storage::{HeaderCache, StorageConfig, StorageServices};
//! use harvest_table::InMemoryTableStore;
//! use object_store::memory::InMemory;
//! use tokio_util::sync::CancellationToken;
//!
//! let services = StorageServices::new(
//!     Arc::new(InMemoryTableStore::new()),
//!     Arc::new(InMemory::new()),
//!     Arc::new(HeaderCache::new()),
//!     &StorageConfig::from_env()?,
//! )?;
//! let cancel = CancellationToken::new();
//!
//! let results = &services.append_results;
//! results.initialize("log", "versions", &cancel).await?;
//! results.append("log", 1000, records, &cancel).await?;
//!
//! for bucket in results.get_appended_buckets("log", &cancel).await? {
//!     results
//!         .compact::<PackageVersion, _>("log", "versions", bucket, false, keep_latest, &cancel)
//!         .await?;
//! }
//! ```
//!
//! ## Errors
//!
//! Every operation returns [`Result`]. [`Error::kind`] sorts failures into capacity,
//! concurrency, transient, invariant and cancellation errors so orchestration code
//! can decide between rerunning an operation and aborting.

pub mod append;
pub mod config;
pub mod error;
pub mod wide_entity;

pub use append::{
    AppendResultStorageService, CompactedRead, CompactionOutcome, CompactionStats, CsvRecord,
    HeaderCache, MARKER_PARTITION_KEY,
};
pub use config::{AppendResultConfig, LogRetention, StorageConfig, WideEntityConfig};
pub use error::{Error, ErrorKind, Result};
pub use wide_entity::{WideEntity, WideEntityOperation, WideEntityService};

use std::sync::Arc;

use harvest_table::{RetryingTableStore, TableStore};
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;

/// Fail with `Cancelled` once `cancel` has fired.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Both services wired from one [`StorageConfig`].
pub struct StorageServices {
    pub wide_entities: Arc<WideEntityService>,
    pub append_results: AppendResultStorageService,
}

impl StorageServices {
    /// Wrap `table_store` in a retry layer and build the services on top of it.
    pub fn new<S>(
        table_store: S,
        blobs: Arc<dyn ObjectStore>,
        headers: Arc<HeaderCache>,
        config: &StorageConfig,
    ) -> Result<Self>
    where
        S: TableStore + 'static,
    {
        config.validate()?;
        let store: Arc<dyn TableStore> =
            Arc::new(RetryingTableStore::new(table_store, config.retry.clone()));
        let wide_entities = Arc::new(WideEntityService::new(store, config.wide_entity.clone())?);
        let append_results = AppendResultStorageService::new(
            wide_entities.clone(),
            blobs,
            headers,
            config.append.clone(),
        )?;
        Ok(Self {
            wide_entities,
            append_results,
        })
    }
}
