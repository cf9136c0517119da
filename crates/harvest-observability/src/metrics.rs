use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Table Metrics
    // ============================================================================

    /// Transactions submitted to the table backend, by outcome (ok, conflict, capacity, transient, error)
    pub static ref TABLE_TRANSACTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_table_transactions_total", "Total table transactions submitted"),
        &["table", "outcome"]
    ).expect("metric can be created");

    /// Transient backend failures that were retried
    pub static ref TABLE_TRANSIENT_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_table_transient_retries_total", "Total transient table retries"),
        &["table"]
    ).expect("metric can be created");

    /// Conflicts on retried transactions that turned out to be our own earlier commit
    pub static ref TABLE_NOOP_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_table_noop_retries_total", "Total retried transactions detected as already committed"),
        &["table"]
    ).expect("metric can be created");

    // ============================================================================
    // Wide Entity Metrics
    // ============================================================================

    /// Content bytes written through wide entities
    pub static ref WIDE_ENTITY_BYTES_WRITTEN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_wide_entity_bytes_written_total", "Total wide entity content bytes written"),
        &["table"]
    ).expect("metric can be created");

    /// Number of backend transactions a single batch was split into
    pub static ref WIDE_ENTITY_BATCH_TRANSACTIONS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("harvest_wide_entity_batch_transactions", "Backend transactions per wide entity batch")
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        &["table"]
    ).expect("metric can be created");

    // ============================================================================
    // Append Metrics
    // ============================================================================

    /// Records appended to the log, per bucket
    pub static ref APPEND_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_append_records_total", "Total records appended"),
        &["table", "bucket"]
    ).expect("metric can be created");

    /// Serialized bytes appended to the log, per bucket
    pub static ref APPEND_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_append_bytes_total", "Total serialized bytes appended"),
        &["table", "bucket"]
    ).expect("metric can be created");

    /// Distinct buckets touched by one append call
    pub static ref APPEND_BUCKETS_PER_BATCH: Histogram = Histogram::with_opts(
        HistogramOpts::new("harvest_append_buckets_per_batch", "Buckets touched per append call")
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]),
    ).expect("metric can be created");

    /// Record groups split in half because they were too large for one entity
    pub static ref APPEND_SPLITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_append_splits_total", "Total oversized append splits"),
        &["table"]
    ).expect("metric can be created");

    /// Generated row key collisions that were retried with a fresh key
    pub static ref APPEND_KEY_CONFLICTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_append_key_conflicts_total", "Total generated row key conflicts"),
        &["table"]
    ).expect("metric can be created");

    // ============================================================================
    // Compaction Metrics
    // ============================================================================

    /// Records seen by compaction, by stage (new, existing, final)
    pub static ref COMPACTION_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_compaction_records_total", "Total records processed by compaction"),
        &["container", "stage"]
    ).expect("metric can be created");

    /// Compaction outcomes (skipped, unchanged, written)
    pub static ref COMPACTION_OUTCOMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("harvest_compaction_outcomes_total", "Total compaction outcomes"),
        &["container", "outcome"]
    ).expect("metric can be created");

    /// Size of the last compacted blob, compressed and uncompressed
    pub static ref COMPACTED_BLOB_SIZE_BYTES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("harvest_compacted_blob_size_bytes", "Size of the latest compacted blob"),
        &["container", "bucket", "kind"]
    ).expect("metric can be created");

    /// Compaction latency
    pub static ref COMPACTION_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("harvest_compaction_latency_seconds", "Compaction latency in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["container"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Table metrics
        REGISTRY
            .register(Box::new(TABLE_TRANSACTIONS_TOTAL.clone()))
            .expect("table_transactions_total can be registered");
        REGISTRY
            .register(Box::new(TABLE_TRANSIENT_RETRIES_TOTAL.clone()))
            .expect("table_transient_retries_total can be registered");
        REGISTRY
            .register(Box::new(TABLE_NOOP_RETRIES_TOTAL.clone()))
            .expect("table_noop_retries_total can be registered");

        // Wide entity metrics
        REGISTRY
            .register(Box::new(WIDE_ENTITY_BYTES_WRITTEN_TOTAL.clone()))
            .expect("wide_entity_bytes_written_total can be registered");
        REGISTRY
            .register(Box::new(WIDE_ENTITY_BATCH_TRANSACTIONS.clone()))
            .expect("wide_entity_batch_transactions can be registered");

        // Append metrics
        REGISTRY
            .register(Box::new(APPEND_RECORDS_TOTAL.clone()))
            .expect("append_records_total can be registered");
        REGISTRY
            .register(Box::new(APPEND_BYTES_TOTAL.clone()))
            .expect("append_bytes_total can be registered");
        REGISTRY
            .register(Box::new(APPEND_BUCKETS_PER_BATCH.clone()))
            .expect("append_buckets_per_batch can be registered");
        REGISTRY
            .register(Box::new(APPEND_SPLITS_TOTAL.clone()))
            .expect("append_splits_total can be registered");
        REGISTRY
            .register(Box::new(APPEND_KEY_CONFLICTS_TOTAL.clone()))
            .expect("append_key_conflicts_total can be registered");

        // Compaction metrics
        REGISTRY
            .register(Box::new(COMPACTION_RECORDS_TOTAL.clone()))
            .expect("compaction_records_total can be registered");
        REGISTRY
            .register(Box::new(COMPACTION_OUTCOMES_TOTAL.clone()))
            .expect("compaction_outcomes_total can be registered");
        REGISTRY
            .register(Box::new(COMPACTED_BLOB_SIZE_BYTES.clone()))
            .expect("compacted_blob_size_bytes can be registered");
        REGISTRY
            .register(Box::new(COMPACTION_LATENCY.clone()))
            .expect("compaction_latency can be registered");
    });
}
