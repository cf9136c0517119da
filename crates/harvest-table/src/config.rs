//! Table Backend Configuration
//!
//! ## TableLimits
//!
//! Hard limits enforced by the backend on every transaction:
//!
//! - **max_batch_operations**: actions per transaction (default: 100)
//! - **max_request_bytes**: encoded request body, binary counted as base64 (default: 4 MiB)
//! - **max_entity_bytes**: size of one row by the entity size model (default: 1 MiB)
//! - **max_binary_property_bytes**: one binary property (default: 64 KiB)
//!
//! ## RetryConfig
//!
//! Controls how `RetryingTableStore` retries transient failures:
//!
//! - **max_attempts**: total attempts including the first (default: 4)
//! - **base_delay_ms**: delay before the first retry, doubled per attempt (default: 100ms)
//! - **max_delay_ms**: ceiling for a single delay (default: 5s)
//!
//! ## Usage
//!
//! ```ignore
//! use harvest_table::{RetryConfig, TableLimits};
//!
//! // Tight limits to exercise splitting in tests
//! let limits = TableLimits {
//!     max_request_bytes: 64 * 1024,
//!     ..Default::default()
//! };
//!
//! let retry = RetryConfig {
//!     max_attempts: 2,
//!     base_delay_ms: 1,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLimits {
    /// Maximum actions in one transaction (default: 100)
    #[serde(default = "default_max_batch_operations")]
    pub max_batch_operations: usize,

    /// Maximum encoded request size in bytes (default: 4 MiB)
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Maximum size of one entity in bytes (default: 1 MiB)
    #[serde(default = "default_max_entity_bytes")]
    pub max_entity_bytes: usize,

    /// Maximum size of one binary property in bytes (default: 64 KiB)
    #[serde(default = "default_max_binary_property_bytes")]
    pub max_binary_property_bytes: usize,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            max_batch_operations: default_max_batch_operations(),
            max_request_bytes: default_max_request_bytes(),
            max_entity_bytes: default_max_entity_bytes(),
            max_binary_property_bytes: default_max_binary_property_bytes(),
        }
    }
}

fn default_max_batch_operations() -> usize {
    100
}

fn default_max_request_bytes() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

fn default_max_entity_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_max_binary_property_bytes() -> usize {
    64 * 1024 // 64 KiB
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 4)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 100)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay between attempts in milliseconds (default: 5000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}
