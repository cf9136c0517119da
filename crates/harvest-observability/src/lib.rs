//! Harvest Observability
//!
//! Provides metrics and logging for the Harvest storage layer.
//!
//! # Features
//!
//! - Prometheus metrics for table transactions, appends and compactions
//! - Text exposition of the registry (`gather_text`) for whatever serves it
//! - `tracing` subscriber setup driven by `RUST_LOG`
//!
//! # Usage
//!
//! ```no_run
//! use harvest_observability::{exporter, init};
//!
//! init();
//! let text = exporter::gather_text().unwrap();
//! println!("{text}");
//! ```

pub mod exporter;
pub mod metrics;

// Re-export commonly used items
pub use exporter::gather_text;
pub use metrics::{init as init_metrics, REGISTRY};

use tracing_subscriber::EnvFilter;

/// Initialize all observability components
pub fn init() {
    metrics::init();
}

/// Install a global `tracing` subscriber. The filter comes from `RUST_LOG`, defaulting
/// to `info`. Returns `false` when a subscriber was already installed.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        init();
    }

    #[test]
    fn test_init_metrics_alias() {
        init_metrics();
    }

    #[test]
    fn test_registry_accessible() {
        init();
        let _registry = &*REGISTRY;
    }

    #[test]
    fn test_double_init_is_safe() {
        init();
        init();
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        assert!(!init_tracing());
    }
}
