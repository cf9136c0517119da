//! Chaos / Fault-Injection Tests for the Harvest Storage Layer
//!
//! Transient backend failures injected between and after transactions, and
//! concurrent writers racing on the same entities, buckets and blobs.
//!
//! These tests push the services past the happy path and check that no write is
//! lost, duplicated or half-applied.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use harvest_storage::{
    CompactionOutcome, CsvRecord, Error, ErrorKind, HeaderCache, LogRetention, StorageConfig,
    StorageServices, WideEntityConfig, WideEntityOperation, WideEntityService,
};
use harvest_table::{
    ContinuationToken, InMemoryTableStore, QueryPage, RetryConfig, RetryingTableStore,
    TableAction, TableError, TableQuery, TableStore,
};
use object_store::memory::InMemory;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const TABLE: &str = "chaos";

// ============================================================================
// Fault Injection Helpers
// ============================================================================

/// Deterministic fault injector: fails 1 out of every N calls, starting with the
/// first one.
struct FaultInjector {
    failure_denominator: u64,
    counter: AtomicU64,
    faults_injected: AtomicU64,
}

impl FaultInjector {
    fn new(failure_denominator: u64) -> Self {
        assert!(failure_denominator >= 1, "denominator must be >= 1");
        Self {
            failure_denominator,
            counter: AtomicU64::new(0),
            faults_injected: AtomicU64::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let fail = count % self.failure_denominator == 0;
        if fail {
            self.faults_injected.fetch_add(1, Ordering::Relaxed);
        }
        fail
    }

    fn total_faults(&self) -> u64 {
        self.faults_injected.load(Ordering::Relaxed)
    }
}

/// Table backend whose transactions fail with `Transient` once armed.
///
/// With `commit_before_failing` the failed transaction is applied first, which is
/// what a timeout after a successful write looks like to the client.
struct FaultyTableStore {
    inner: InMemoryTableStore,
    injector: FaultInjector,
    armed: AtomicBool,
    commit_before_failing: bool,
}

impl FaultyTableStore {
    fn new(failure_denominator: u64, commit_before_failing: bool) -> Self {
        Self {
            inner: InMemoryTableStore::new(),
            injector: FaultInjector::new(failure_denominator),
            armed: AtomicBool::new(false),
            commit_before_failing,
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TableStore for FaultyTableStore {
    async fn create_table(&self, table: &str) -> harvest_table::Result<()> {
        self.inner.create_table(table).await
    }

    async fn delete_table(&self, table: &str) -> harvest_table::Result<()> {
        self.inner.delete_table(table).await
    }

    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
        max_per_page: usize,
    ) -> harvest_table::Result<QueryPage> {
        self.inner
            .query_page(table, query, continuation, max_per_page)
            .await
    }

    async fn submit_transaction(
        &self,
        table: &str,
        actions: Vec<TableAction>,
    ) -> harvest_table::Result<Vec<Option<String>>> {
        if self.armed.load(Ordering::SeqCst) && self.injector.should_fail() {
            if self.commit_before_failing {
                self.inner.submit_transaction(table, actions).await?;
            }
            return Err(TableError::Transient("injected fault".to_string()));
        }
        self.inner.submit_transaction(table, actions).await
    }
}

/// Spawn `n` concurrent tasks that each execute `work` and return all results.
async fn spawn_concurrent<F, Fut, T>(n: usize, work: F) -> Vec<T>
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let work = Arc::new(work);
    let mut handles = Vec::with_capacity(n);
    for i in 0..n {
        let w = work.clone();
        handles.push(tokio::spawn(async move { w(i).await }));
    }
    let mut results = Vec::with_capacity(n);
    for h in handles {
        results.push(h.await.expect("task panicked"));
    }
    results
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        base_delay_ms: 1,
        max_delay_ms: 10,
    }
}

fn payload(len: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i % 241) as u8 ^ seed)
            .collect::<Vec<u8>>(),
    )
}

async fn faulty_service(
    store: Arc<FaultyTableStore>,
    config: WideEntityConfig,
    retry: bool,
) -> WideEntityService {
    let backend: Arc<dyn TableStore> = if retry {
        Arc::new(RetryingTableStore::new(store, fast_retry()))
    } else {
        store
    };
    let service = WideEntityService::new(backend, config).unwrap();
    service
        .create_table(TABLE, &CancellationToken::new())
        .await
        .unwrap();
    service
}

// ============================================================================
// 1. Transient Failures
// ============================================================================

/// Every split transaction fails once before succeeding; the batch still lands
/// completely.
#[tokio::test]
async fn chaos_transient_failure_between_split_transactions() {
    let store = Arc::new(FaultyTableStore::new(2, false));
    let service = faulty_service(store.clone(), WideEntityConfig::default(), true).await;
    let cancel = CancellationToken::new();
    store.arm();

    let len = 1_500_000;
    let operations = (0..3)
        .map(|i| WideEntityOperation::insert("pk", format!("big-{i}"), payload(len, i)))
        .collect::<Vec<_>>();
    let results = service
        .execute_batch(TABLE, operations, true, &cancel)
        .await
        .unwrap();

    // Three transactions, one injected fault each
    assert_eq!(store.injector.total_faults(), 3);
    for i in 0..3u8 {
        let entity = service
            .retrieve(TABLE, "pk", &format!("big-{i}"), true, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.etag(), results[i as usize].as_ref().unwrap().etag());
        assert_eq!(entity.to_bytes().unwrap(), payload(len, i));
    }
}

/// Writes that committed but were reported as failed are recognised on retry.
#[tokio::test]
async fn chaos_committed_write_reported_as_failed() {
    let store = Arc::new(FaultyTableStore::new(2, true));
    let service = faulty_service(store.clone(), WideEntityConfig::default(), true).await;
    let cancel = CancellationToken::new();
    store.arm();

    let operations = (0..3)
        .map(|i| WideEntityOperation::insert("pk", format!("big-{i}"), payload(1_500_000, i)))
        .collect::<Vec<_>>();
    let results = service
        .execute_batch(TABLE, operations, true, &cancel)
        .await
        .unwrap();
    assert_eq!(store.injector.total_faults(), 3);

    let stored = service
        .retrieve_partition(TABLE, "pk", false, &cancel)
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    for (entity, result) in stored.iter().zip(&results) {
        assert_eq!(entity.etag(), result.as_ref().unwrap().etag());
    }
}

/// A replace that shrinks an entity and commits before its reply is lost.
#[tokio::test]
async fn chaos_committed_replace_reported_as_failed() {
    let store = Arc::new(FaultyTableStore::new(2, true));
    let config = WideEntityConfig {
        segment_size: 1024,
        max_batch_data_size: 100_000,
        max_segments_per_entity: 32,
        ..Default::default()
    };
    let service = faulty_service(store.clone(), config, true).await;
    let cancel = CancellationToken::new();

    let original = service
        .insert(TABLE, "pk", "doc", payload(3_000, 1), &cancel)
        .await
        .unwrap();
    assert_eq!(original.segment_count(), 3);

    store.arm();
    let replaced = service
        .replace(TABLE, &original, payload(500, 2), &cancel)
        .await
        .unwrap();
    assert_eq!(store.injector.total_faults(), 1);
    assert_eq!(replaced.segment_count(), 1);

    let stored = service
        .retrieve(TABLE, "pk", "doc", true, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.etag(), replaced.etag());
    assert_eq!(stored.segment_count(), 1);
    assert_eq!(stored.to_bytes().unwrap(), payload(500, 2));
}

/// Without the retry layer a transient failure reaches the caller as such.
#[tokio::test]
async fn chaos_transient_failure_without_retries() {
    let store = Arc::new(FaultyTableStore::new(1, false));
    let service = faulty_service(store.clone(), WideEntityConfig::default(), false).await;
    let cancel = CancellationToken::new();
    store.arm();

    let err = service
        .insert(TABLE, "pk", "lost", payload(10, 0), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.is_retryable());
    assert_eq!(store.inner.row_count(TABLE).await, Some(0));
}

// ============================================================================
// 2. Concurrent Writers
// ============================================================================

/// Many writers replace the same entity from the same starting etag. Exactly one
/// wins and the stored content is entirely the winner's.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_replace_single_winner() {
    let store = Arc::new(InMemoryTableStore::new());
    let config = WideEntityConfig {
        segment_size: 1024,
        max_batch_data_size: 100_000,
        max_segments_per_entity: 32,
        ..Default::default()
    };
    let service = Arc::new(WideEntityService::new(store, config).unwrap());
    let cancel = CancellationToken::new();
    service.create_table(TABLE, &cancel).await.unwrap();
    let original = service
        .insert(TABLE, "pk", "contended", payload(2_000, 0), &cancel)
        .await
        .unwrap();

    let s = service.clone();
    let results = spawn_concurrent(8, move |i| {
        let s = s.clone();
        let original = original.clone();
        async move {
            let content = payload(3_000 + i * 100, i as u8 + 1);
            let result = s
                .replace(TABLE, &original, content, &CancellationToken::new())
                .await;
            (i, result)
        }
    })
    .await;

    let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
    assert_eq!(winners.len(), 1, "expected exactly one winner");
    for (_, result) in &results {
        if let Err(e) = result {
            assert!(matches!(e, Error::PreconditionFailed { .. }), "{e}");
        }
    }

    let winner = winners[0].0;
    let stored = service
        .retrieve(TABLE, "pk", "contended", true, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.to_bytes().unwrap(),
        payload(3_000 + winner * 100, winner as u8 + 1)
    );
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CatalogLeaf {
    id: String,
    worker: u32,
}

impl CsvRecord for CatalogLeaf {
    const HEADER: &'static [&'static str] = &["Id", "Worker"];

    fn bucket_key(&self) -> String {
        self.id.clone()
    }

    fn record_key(&self) -> Option<String> {
        Some(self.id.clone())
    }
}

fn keep_latest(records: Vec<CatalogLeaf>) -> Vec<CatalogLeaf> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}

async fn storage(config: StorageConfig) -> Arc<StorageServices> {
    let services = StorageServices::new(
        InMemoryTableStore::new(),
        Arc::new(InMemory::new()),
        Arc::new(HeaderCache::new()),
        &config,
    )
    .unwrap();
    services
        .append_results
        .initialize("log", "leaves", &CancellationToken::new())
        .await
        .unwrap();
    Arc::new(services)
}

async fn compacted_count(services: &StorageServices, buckets: u32) -> usize {
    let mut total = 0;
    for bucket in 0..buckets {
        total += services
            .append_results
            .read::<CatalogLeaf>("leaves", bucket, &CancellationToken::new())
            .await
            .unwrap()
            .into_records()
            .len();
    }
    total
}

/// Concurrent appends into the same buckets never overwrite each other.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_appends_lose_nothing() {
    let services = storage(StorageConfig::default()).await;

    let s = services.clone();
    let results = spawn_concurrent(16, move |worker| {
        let s = s.clone();
        async move {
            let records = (0..10)
                .map(|j| CatalogLeaf {
                    id: format!("w{worker}-r{j}"),
                    worker: worker as u32,
                })
                .collect();
            s.append_results
                .append("log", 4, records, &CancellationToken::new())
                .await
        }
    })
    .await;
    assert!(results.iter().all(|r| r.is_ok()));

    let cancel = CancellationToken::new();
    let results = &services.append_results;
    for bucket in results.get_appended_buckets("log", &cancel).await.unwrap() {
        results
            .compact("log", "leaves", bucket, false, keep_latest, &cancel)
            .await
            .unwrap();
    }
    assert_eq!(compacted_count(&services, 4).await, 160);
}

/// Concurrent compactions of one bucket: one writes, the rest either see its blob
/// or lose the conditional write.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_compactions_single_writer() {
    let services = storage(StorageConfig::default()).await;
    let cancel = CancellationToken::new();
    let records = (0..50)
        .map(|i| CatalogLeaf {
            id: format!("leaf-{i}"),
            worker: 0,
        })
        .collect();
    services
        .append_results
        .append("log", 1, records, &cancel)
        .await
        .unwrap();

    let s = services.clone();
    let outcomes = spawn_concurrent(4, move |_| {
        let s = s.clone();
        async move {
            s.append_results
                .compact("log", "leaves", 0, false, keep_latest, &CancellationToken::new())
                .await
        }
    })
    .await;

    let mut written = 0;
    for outcome in &outcomes {
        match outcome {
            Ok(CompactionOutcome::Written(_)) => written += 1,
            Ok(CompactionOutcome::Unchanged(_)) => {}
            Err(Error::BlobConflict { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(written, 1);
    assert_eq!(compacted_count(&services, 1).await, 50);
}

/// Appends keep landing while a compactor clears consumed log entries. Every
/// record ends up in the blob once the log is drained.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_appends_racing_clearing_compaction() {
    let mut config = StorageConfig::default();
    config.append.log_retention = LogRetention::ClearConsumed;
    let services = storage(config).await;
    let cancel = CancellationToken::new();

    let s = services.clone();
    let appender = tokio::spawn(async move {
        for batch in 0..20 {
            let records = (0..5)
                .map(|j| CatalogLeaf {
                    id: format!("b{batch}-r{j}"),
                    worker: batch,
                })
                .collect();
            s.append_results
                .append("log", 1, records, &CancellationToken::new())
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
    });

    let results = &services.append_results;
    while !appender.is_finished() {
        results
            .compact("log", "leaves", 0, false, keep_latest, &cancel)
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }
    appender.await.unwrap();

    for _ in 0..3 {
        for bucket in results.get_appended_buckets("log", &cancel).await.unwrap() {
            results
                .compact("log", "leaves", bucket, false, keep_latest, &cancel)
                .await
                .unwrap();
        }
    }

    assert!(results.get_appended_buckets("log", &cancel).await.unwrap().is_empty());
    assert_eq!(compacted_count(&services, 1).await, 100);
}
