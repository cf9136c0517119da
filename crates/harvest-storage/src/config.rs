//! Storage Configuration
//!
//! This module defines configuration for the wide entity store and the append log.
//!
//! ## WideEntityConfig
//!
//! Controls how payloads are cut into segment rows and how batches are split:
//!
//! - **segment_size**: payload bytes per segment row (default: 15 × 64 KiB)
//! - **max_batch_data_size**: entity bytes per backend transaction (default: 68% of 4 MiB)
//! - **max_segments_per_entity**: used to derive `max_total_data_size()` (default: 8)
//! - **max_batch_operations**: actions per backend transaction (default: 100)
//! - **max_split_depth**: recursion bound for batch halving (default: 16)
//! - **max_per_page**: rows requested per query page (default: 1000)
//! - **max_generated_key_attempts**: inserts tried with fresh generated keys (default: 3)
//!
//! ## AppendResultConfig
//!
//! Controls the append log and compaction:
//!
//! - **use_gzip**: compress compacted blobs (default: true)
//! - **log_retention**: what compaction does with consumed log rows (default: keep)
//! - **initial_csv_buffer_size** / **max_csv_buffer_size**: per-row CSV buffer (32 KiB / 16 MiB)
//! - **max_append_split_depth**: recursion bound for halving oversized appends (default: 16)
//! - **blob_base_url**: prefix for `get_compacted_blob_url` (default: `memory://`)
//!
//! ## Usage
//!
//! ```ignore
//! use harvest_storage::{StorageConfig, LogRetention};
//!
//! let mut config = StorageConfig::from_env()?;
//! config.append.log_retention = LogRetention::ClearConsumed;
//! config.wide_entity.segment_size = 64 * 1024; // small segments for testing
//! config.validate()?;
//! ```

use harvest_table::size::EntitySizeCalculator;
use harvest_table::{RetryConfig, TableLimits, CLIENT_REQUEST_ID_LEN, CLIENT_REQUEST_ID_PROPERTY};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest partition or row key the backend accepts, in UTF-16 code units.
pub const MAX_KEY_CHARS: usize = 512;

/// Payload properties of one segment row, in order.
pub const CHUNK_PROPERTIES: [&str; 16] = [
    "D", "E", "F", "G", "H", "I", "J", "K", "L", "M", "N", "O", "P", "Q", "R", "S",
];

/// Property of segment 0 holding the segment count.
pub const SEGMENT_COUNT_PROPERTY: &str = "C";

/// Largest value of one binary property.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WideEntityConfig {
    /// Payload bytes per segment row (default: 15 × 64 KiB)
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    /// Sum of entity sizes allowed in one transaction (default: 68% of 4 MiB)
    #[serde(default = "default_max_batch_data_size")]
    pub max_batch_data_size: usize,

    /// Segment budget used to derive the payload ceiling (default: 8)
    #[serde(default = "default_max_segments_per_entity")]
    pub max_segments_per_entity: usize,

    /// Actions per transaction (default: 100)
    #[serde(default = "default_max_batch_operations")]
    pub max_batch_operations: usize,

    /// Maximum recursion depth when halving a batch (default: 16)
    #[serde(default = "default_max_split_depth")]
    pub max_split_depth: u32,

    /// Rows per query page (default: 1000)
    #[serde(default = "default_max_per_page")]
    pub max_per_page: usize,

    /// Inserts attempted with freshly generated row keys (default: 3)
    #[serde(default = "default_max_generated_key_attempts")]
    pub max_generated_key_attempts: u32,
}

impl Default for WideEntityConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            max_batch_data_size: default_max_batch_data_size(),
            max_segments_per_entity: default_max_segments_per_entity(),
            max_batch_operations: default_max_batch_operations(),
            max_split_depth: default_max_split_depth(),
            max_per_page: default_max_per_page(),
            max_generated_key_attempts: default_max_generated_key_attempts(),
        }
    }
}

impl WideEntityConfig {
    /// Largest payload a single wide entity may hold.
    ///
    /// Every segment of a maximal entity must fit one transaction together with the
    /// worst-case row overhead, so the per-segment overhead is subtracted for each
    /// segment in the budget.
    pub fn max_total_data_size(&self) -> usize {
        self.max_batch_data_size.saturating_sub(
            self.max_segments_per_entity * worst_case_segment_overhead(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 || self.segment_size > MAX_CHUNK_SIZE * CHUNK_PROPERTIES.len() {
            return Err(Error::InvalidArgument(format!(
                "segment_size must be between 1 and {}",
                MAX_CHUNK_SIZE * CHUNK_PROPERTIES.len()
            )));
        }
        if self.max_batch_operations == 0 || self.max_per_page == 0 {
            return Err(Error::InvalidArgument(
                "max_batch_operations and max_per_page must be positive".to_string(),
            ));
        }
        if self.max_generated_key_attempts == 0 {
            return Err(Error::InvalidArgument(
                "max_generated_key_attempts must be positive".to_string(),
            ));
        }
        let max_total = self.max_total_data_size();
        if max_total == 0 || max_total.div_ceil(self.segment_size) > self.max_segments_per_entity {
            return Err(Error::InvalidArgument(format!(
                "a {max_total} byte payload does not fit {} segments of {} bytes",
                self.max_segments_per_entity, self.segment_size
            )));
        }
        Ok(())
    }
}

/// Entity size of the largest possible segment row, excluding its payload.
///
/// Keys at their maximum length, the segment count, the client request id stamped by
/// the retry layer and all chunk properties.
pub fn worst_case_segment_overhead() -> usize {
    let mut calc = EntitySizeCalculator::new();
    calc.add_entity_overhead()
        .add_partition_key(MAX_KEY_CHARS)
        .add_row_key(MAX_KEY_CHARS)
        .add_property_overhead(SEGMENT_COUNT_PROPERTY.len())
        .add_int32_data()
        .add_property_overhead(CLIENT_REQUEST_ID_PROPERTY.len())
        .add_string_data(CLIENT_REQUEST_ID_LEN);
    for name in CHUNK_PROPERTIES {
        calc.add_property_overhead(name.len()).add_binary_data(0);
    }
    calc.size()
}

/// What compaction does with the log rows it consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRetention {
    /// Leave log rows and markers in place; an external sweep deletes the log table.
    #[default]
    Keep,
    /// Delete the bucket marker and every consumed log entity.
    ClearConsumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResultConfig {
    /// Gzip compacted blobs (default: true)
    #[serde(default = "default_use_gzip")]
    pub use_gzip: bool,

    #[serde(default)]
    pub log_retention: LogRetention,

    /// Starting per-row CSV buffer (default: 32 KiB)
    #[serde(default = "default_initial_csv_buffer_size")]
    pub initial_csv_buffer_size: usize,

    /// Largest per-row CSV buffer (default: 16 MiB)
    #[serde(default = "default_max_csv_buffer_size")]
    pub max_csv_buffer_size: usize,

    /// Maximum recursion depth when halving an oversized append (default: 16)
    #[serde(default = "default_max_split_depth")]
    pub max_append_split_depth: u32,

    /// Base URL compacted blob paths are rendered against
    #[serde(default = "default_blob_base_url")]
    pub blob_base_url: String,
}

impl Default for AppendResultConfig {
    fn default() -> Self {
        Self {
            use_gzip: default_use_gzip(),
            log_retention: LogRetention::default(),
            initial_csv_buffer_size: default_initial_csv_buffer_size(),
            max_csv_buffer_size: default_max_csv_buffer_size(),
            max_append_split_depth: default_max_split_depth(),
            blob_base_url: default_blob_base_url(),
        }
    }
}

/// Configuration of the whole storage layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub wide_entity: WideEntityConfig,

    #[serde(default)]
    pub append: AppendResultConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub table_limits: TableLimits,
}

impl StorageConfig {
    /// Defaults overridden by `HARVEST_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `HARVEST_*` name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "HARVEST_SEGMENT_SIZE")? {
            config.wide_entity.segment_size = v;
        }
        if let Some(v) = parse(&lookup, "HARVEST_MAX_SPLIT_DEPTH")? {
            config.wide_entity.max_split_depth = v;
            config.append.max_append_split_depth = v;
        }
        if let Some(v) = parse(&lookup, "HARVEST_MAX_PER_PAGE")? {
            config.wide_entity.max_per_page = v;
        }
        if let Some(v) = parse(&lookup, "HARVEST_USE_GZIP")? {
            config.append.use_gzip = v;
        }
        if let Some(v) = lookup("HARVEST_LOG_RETENTION") {
            config.append.log_retention = match v.trim() {
                "keep" => LogRetention::Keep,
                "clear_consumed" => LogRetention::ClearConsumed,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "HARVEST_LOG_RETENTION must be 'keep' or 'clear_consumed', got '{other}'"
                    )))
                }
            };
        }
        if let Some(v) = parse(&lookup, "HARVEST_MAX_CSV_BUFFER_SIZE")? {
            config.append.max_csv_buffer_size = v;
        }
        if let Some(v) = lookup("HARVEST_BLOB_BASE_URL") {
            config.append.blob_base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = parse(&lookup, "HARVEST_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse(&lookup, "HARVEST_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.wide_entity.validate()?;
        if self.wide_entity.max_batch_operations > self.table_limits.max_batch_operations {
            return Err(Error::InvalidArgument(format!(
                "max_batch_operations {} exceeds the backend limit {}",
                self.wide_entity.max_batch_operations, self.table_limits.max_batch_operations
            )));
        }
        if self.append.initial_csv_buffer_size == 0
            || self.append.initial_csv_buffer_size > self.append.max_csv_buffer_size
        {
            return Err(Error::InvalidArgument(
                "initial_csv_buffer_size must be positive and at most max_csv_buffer_size"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidArgument(format!("{name}='{raw}': {e}"))),
        None => Ok(None),
    }
}

fn default_segment_size() -> usize {
    15 * MAX_CHUNK_SIZE // 960 KiB
}

fn default_max_batch_data_size() -> usize {
    4 * 1024 * 1024 * 68 / 100 // 68% of the 4 MiB request limit
}

fn default_max_segments_per_entity() -> usize {
    8
}

fn default_max_batch_operations() -> usize {
    100
}

fn default_max_split_depth() -> u32 {
    16
}

fn default_max_per_page() -> usize {
    1000
}

fn default_max_generated_key_attempts() -> u32 {
    3
}

fn default_use_gzip() -> bool {
    true
}

fn default_initial_csv_buffer_size() -> usize {
    32 * 1024 // 32 KiB
}

fn default_max_csv_buffer_size() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_blob_base_url() -> String {
    "memory://".to_string()
}
