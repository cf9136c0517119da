//! Append Result Storage Service
//!
//! Bucketed append log on top of [`WideEntityService`] with compaction into one CSV
//! blob per bucket in an [`ObjectStore`].
//!
//! ## Log retention
//!
//! With [`LogRetention::Keep`] compaction never touches the log; the orchestrator
//! drops the whole log table once every bucket is compacted, and compacting again
//! before that re-reads the same log rows (prune must deduplicate them).
//!
//! With [`LogRetention::ClearConsumed`] a pass runs:
//!
//! ```text
//! delete marker ─► read log ─► merge + write blob ─► delete consumed log rows
//!       │                                                   │
//!       └────────── on failure: re-insert marker ◄──────────┘
//! ```
//!
//! Appends write data before the marker, so an append racing the pass either lands
//! before the log read (and is consumed) or re-creates the marker for the next pass.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::TryStreamExt;
use harvest_core::{get_bucket, StorageIdGenerator};
use harvest_observability::metrics;
use object_store::path::Path;
use object_store::{
    Attribute, Attributes, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion,
};
use tokio_util::sync::CancellationToken;

use super::csv_blob::{content_sha256, gunzip, gzip, read_csv, write_csv};
use super::{CompactedRead, CompactionOutcome, CompactionStats, CsvRecord, HeaderCache};
use crate::config::{AppendResultConfig, LogRetention};
use crate::ensure_not_cancelled;
use crate::error::{Error, ErrorKind, Result};
use crate::wide_entity::{WideEntity, WideEntityOperation, WideEntityService};

/// Partition holding one marker row per bucket with pending appends.
pub const MARKER_PARTITION_KEY: &str = "";

const BLOB_PREFIX: &str = "compact_";
const RAW_SIZE_KEY: &str = "rawSizeBytes";
const RECORD_COUNT_KEY: &str = "recordCount";
const CONTENT_SHA256_KEY: &str = "contentSha256";
const MAX_DUPLICATE_SAMPLES: usize = 10;

/// A compacted blob as downloaded.
struct StoredBlob<T> {
    records: Vec<T>,
    version: UpdateVersion,
    content_sha256: Option<String>,
    size: usize,
}

pub struct AppendResultStorageService {
    wide_entities: Arc<WideEntityService>,
    blobs: Arc<dyn ObjectStore>,
    headers: Arc<HeaderCache>,
    ids: Arc<StorageIdGenerator>,
    config: AppendResultConfig,
}

impl AppendResultStorageService {
    pub fn new(
        wide_entities: Arc<WideEntityService>,
        blobs: Arc<dyn ObjectStore>,
        headers: Arc<HeaderCache>,
        config: AppendResultConfig,
    ) -> Result<Self> {
        if config.initial_csv_buffer_size == 0
            || config.initial_csv_buffer_size > config.max_csv_buffer_size
        {
            return Err(Error::InvalidArgument(
                "initial_csv_buffer_size must be positive and at most max_csv_buffer_size"
                    .to_string(),
            ));
        }
        Ok(Self {
            wide_entities,
            blobs,
            headers,
            ids: Arc::new(StorageIdGenerator::new()),
            config,
        })
    }

    /// Share one id generator between services writing to the same log tables.
    pub fn with_id_generator(mut self, ids: Arc<StorageIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &AppendResultConfig {
        &self.config
    }

    /// Create the log table. Containers are path prefixes and need no setup.
    pub async fn initialize(
        &self,
        log_table: &str,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.wide_entities.create_table(log_table, cancel).await?;
        tracing::debug!(log_table = %log_table, container = %container, "Initialized append storage");
        Ok(())
    }

    /// Drop the whole log table.
    pub async fn delete(&self, log_table: &str, cancel: &CancellationToken) -> Result<()> {
        self.wide_entities.delete_table(log_table, cancel).await
    }

    // ========================================================================
    // Append
    // ========================================================================

    /// Append `records` to the log, one new log entity per bucket touched.
    pub async fn append<T: CsvRecord>(
        &self,
        log_table: &str,
        bucket_count: u32,
        records: Vec<T>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buckets: BTreeMap<u32, Vec<T>> = BTreeMap::new();
        for record in records {
            let bucket = get_bucket(bucket_count, &record.bucket_key())?;
            buckets.entry(bucket).or_default().push(record);
        }
        metrics::APPEND_BUCKETS_PER_BATCH.observe(buckets.len() as f64);

        for (bucket, records) in &buckets {
            self.append_bucket(log_table, *bucket, records, 0, cancel)
                .await?;
            self.write_marker(log_table, *bucket, cancel).await?;
        }
        Ok(())
    }

    fn append_bucket<'a, T: CsvRecord>(
        &'a self,
        log_table: &'a str,
        bucket: u32,
        records: &'a [T],
        depth: u32,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = Bytes::from(rmp_serde::to_vec(records)?);
            let limit = self.wide_entities.max_total_data_size();
            let partition_key = bucket.to_string();

            let result = if payload.len() > limit {
                Err(Error::ContentTooLarge {
                    size: payload.len(),
                    limit,
                })
            } else {
                let ids = &self.ids;
                self.wide_entities
                    .insert_with_generated_key(
                        log_table,
                        &partition_key,
                        || ids.next_id().to_string(),
                        payload.clone(),
                        cancel,
                    )
                    .await
                    .map(|_| ())
            };

            match result {
                Ok(()) => {
                    metrics::APPEND_RECORDS_TOTAL
                        .with_label_values(&[log_table, partition_key.as_str()])
                        .inc_by(records.len() as u64);
                    metrics::APPEND_BYTES_TOTAL
                        .with_label_values(&[log_table, partition_key.as_str()])
                        .inc_by(payload.len() as u64);
                    tracing::debug!(
                        log_table = %log_table,
                        bucket,
                        record_count = records.len(),
                        bytes = payload.len(),
                        "Appended records"
                    );
                    Ok(())
                }
                Err(e)
                    if e.kind() == ErrorKind::Capacity
                        && records.len() >= 2
                        && depth < self.config.max_append_split_depth =>
                {
                    let mid = records.len() / 2;
                    tracing::debug!(
                        log_table = %log_table,
                        bucket,
                        record_count = records.len(),
                        bytes = payload.len(),
                        depth,
                        error = %e,
                        "Append too large, splitting in half"
                    );
                    metrics::APPEND_SPLITS_TOTAL
                        .with_label_values(&[log_table])
                        .inc();
                    self.append_bucket(log_table, bucket, &records[..mid], depth + 1, cancel)
                        .await?;
                    self.append_bucket(log_table, bucket, &records[mid..], depth + 1, cancel)
                        .await
                }
                Err(e) => Err(e),
            }
        })
    }

    async fn write_marker(
        &self,
        log_table: &str,
        bucket: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self
            .wide_entities
            .insert(
                log_table,
                MARKER_PARTITION_KEY,
                &bucket.to_string(),
                Bytes::new(),
                cancel,
            )
            .await
        {
            Ok(_) | Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the marker of `bucket`. Returns whether this call removed it.
    async fn remove_marker(
        &self,
        log_table: &str,
        bucket: u32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let marker = self
            .wide_entities
            .retrieve(
                log_table,
                MARKER_PARTITION_KEY,
                &bucket.to_string(),
                false,
                cancel,
            )
            .await?;
        let Some(marker) = marker else {
            return Ok(false);
        };
        match self.wide_entities.delete(log_table, &marker, cancel).await {
            Ok(()) => Ok(true),
            Err(Error::NotFound { .. }) | Err(Error::PreconditionFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Buckets with pending appends, ascending.
    pub async fn get_appended_buckets(
        &self,
        log_table: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        let markers = self
            .wide_entities
            .retrieve_partition(log_table, MARKER_PARTITION_KEY, false, cancel)
            .await?;
        let mut buckets = markers
            .iter()
            .map(|marker| {
                marker.row_key().parse::<u32>().map_err(|_| {
                    Error::InvariantViolation(format!(
                        "marker row key '{}' is not a bucket number",
                        marker.row_key()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        buckets.sort_unstable();
        Ok(buckets)
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    /// Fold the pending log entities of `bucket` into its compacted blob.
    ///
    /// `prune` receives log records newest first followed by the previously
    /// compacted records, and returns the records to keep.
    ///
    /// # Errors
    ///
    /// - `BlobConflict`: another compaction wrote the blob first; rerun
    /// - `HeaderMismatch`: the stored blob belongs to another record type
    /// - `DuplicateRecords`: `prune` kept two records with one record key
    pub async fn compact<T, P>(
        &self,
        log_table: &str,
        container: &str,
        bucket: u32,
        force: bool,
        prune: P,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome>
    where
        T: CsvRecord,
        P: FnOnce(Vec<T>) -> Vec<T> + Send,
    {
        let started = Instant::now();
        let marker_removed = match self.config.log_retention {
            LogRetention::Keep => false,
            LogRetention::ClearConsumed => self.remove_marker(log_table, bucket, cancel).await?,
        };

        let result = self
            .compact_bucket(log_table, container, bucket, force, prune, cancel)
            .await;

        match result {
            Ok(outcome) => {
                metrics::COMPACTION_OUTCOMES_TOTAL
                    .with_label_values(&[container, outcome.label()])
                    .inc();
                metrics::COMPACTION_LATENCY
                    .with_label_values(&[container])
                    .observe(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(e) => {
                if marker_removed {
                    // The caller's token may be the reason we failed
                    if let Err(restore) = self
                        .write_marker(log_table, bucket, &CancellationToken::new())
                        .await
                    {
                        tracing::warn!(
                            log_table = %log_table,
                            bucket,
                            error = %restore,
                            "Failed to restore bucket marker after failed compaction"
                        );
                    }
                }
                metrics::COMPACTION_OUTCOMES_TOTAL
                    .with_label_values(&[container, "failed"])
                    .inc();
                Err(e)
            }
        }
    }

    async fn compact_bucket<T, P>(
        &self,
        log_table: &str,
        container: &str,
        bucket: u32,
        force: bool,
        prune: P,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome>
    where
        T: CsvRecord,
        P: FnOnce(Vec<T>) -> Vec<T> + Send,
    {
        let header = self.headers.get::<T>()?;
        let entities = self
            .wide_entities
            .retrieve_partition(log_table, &bucket.to_string(), true, cancel)
            .await?;
        if entities.is_empty() && !force {
            tracing::debug!(log_table = %log_table, bucket, "No pending appends, skipping compaction");
            return Ok(CompactionOutcome::Skipped);
        }

        let mut records: Vec<T> = Vec::new();
        for entity in &entities {
            let batch: Vec<T> = rmp_serde::from_slice(&entity.to_bytes()?)?;
            records.extend(batch);
        }
        let new_records = records.len();

        let path = self.compacted_path(container, bucket);
        ensure_not_cancelled(cancel)?;
        let existing = self.download::<T>(&path, &header).await?;
        let existing_records = existing.as_ref().map_or(0, |blob| blob.records.len());
        let (previous, stored_sha256, stored_size) = match existing {
            Some(blob) => {
                records.extend(blob.records);
                (Some(blob.version), blob.content_sha256, blob.size)
            }
            None => (None, None, 0),
        };

        let records = prune(records);
        check_duplicates(&records)?;
        let csv = write_csv(&header, &records)?;
        let sha256 = content_sha256(&csv);

        let mut stats = CompactionStats {
            new_records,
            existing_records,
            final_records: records.len(),
            uncompressed_size: csv.len(),
            compressed_size: stored_size,
            version: previous.as_ref().and_then(|v| v.e_tag.clone()),
        };

        let outcome = if previous.is_some() && stored_sha256.as_deref() == Some(sha256.as_str()) {
            CompactionOutcome::Unchanged(stats)
        } else {
            let (compressed_size, version) = self
                .upload(&path, csv, &sha256, records.len(), previous, cancel)
                .await?;
            stats.compressed_size = compressed_size;
            stats.version = version;
            CompactionOutcome::Written(stats)
        };

        if self.config.log_retention == LogRetention::ClearConsumed {
            self.delete_consumed(log_table, entities, cancel).await?;
        }

        if let Some(stats) = outcome.stats() {
            let bucket_label = bucket.to_string();
            for (stage, count) in [
                ("new", stats.new_records),
                ("existing", stats.existing_records),
                ("final", stats.final_records),
            ] {
                metrics::COMPACTION_RECORDS_TOTAL
                    .with_label_values(&[container, stage])
                    .inc_by(count as u64);
            }
            metrics::COMPACTED_BLOB_SIZE_BYTES
                .with_label_values(&[container, bucket_label.as_str(), "uncompressed"])
                .set(stats.uncompressed_size as i64);
            metrics::COMPACTED_BLOB_SIZE_BYTES
                .with_label_values(&[container, bucket_label.as_str(), "compressed"])
                .set(stats.compressed_size as i64);

            tracing::info!(
                container = %container,
                bucket,
                outcome = outcome.label(),
                new_records = stats.new_records,
                existing_records = stats.existing_records,
                final_records = stats.final_records,
                uncompressed_size = stats.uncompressed_size,
                compressed_size = stats.compressed_size,
                "Compacted bucket"
            );
        }
        Ok(outcome)
    }

    async fn upload(
        &self,
        path: &Path,
        csv: Vec<u8>,
        sha256: &str,
        record_count: usize,
        previous: Option<UpdateVersion>,
        cancel: &CancellationToken,
    ) -> Result<(usize, Option<String>)> {
        let raw_size = csv.len();
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, "text/plain".into());
        attributes.insert(
            Attribute::Metadata(RAW_SIZE_KEY.into()),
            raw_size.to_string().into(),
        );
        attributes.insert(
            Attribute::Metadata(RECORD_COUNT_KEY.into()),
            record_count.to_string().into(),
        );
        attributes.insert(
            Attribute::Metadata(CONTENT_SHA256_KEY.into()),
            sha256.to_string().into(),
        );
        let body = if self.config.use_gzip {
            attributes.insert(Attribute::ContentEncoding, "gzip".into());
            gzip(&csv)?
        } else {
            csv
        };
        let stored_size = body.len();

        let mode = match previous {
            Some(version) => PutMode::Update(version),
            None => PutMode::Create,
        };
        let options = PutOptions {
            mode,
            attributes,
            ..Default::default()
        };

        ensure_not_cancelled(cancel)?;
        let result = self
            .blobs
            .put_opts(path, PutPayload::from(body), options)
            .await
            .map_err(|e| match e {
                object_store::Error::Precondition { .. }
                | object_store::Error::AlreadyExists { .. } => Error::BlobConflict {
                    path: path.to_string(),
                    source: e,
                },
                other => Error::ObjectStore(other),
            })?;

        tracing::debug!(
            path = %path,
            raw_size,
            stored_size,
            record_count,
            "Uploaded compacted blob"
        );
        Ok((stored_size, result.e_tag))
    }

    async fn delete_consumed(
        &self,
        log_table: &str,
        entities: Vec<WideEntity>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let count = entities.len();
        let operations = entities
            .into_iter()
            .map(WideEntityOperation::delete)
            .collect();
        self.wide_entities
            .execute_batch(log_table, operations, true, cancel)
            .await?;
        tracing::debug!(log_table = %log_table, entities = count, "Deleted consumed log entities");
        Ok(())
    }

    // ========================================================================
    // Compacted blobs
    // ========================================================================

    /// Records of the compacted blob of `bucket`.
    pub async fn read<T: CsvRecord>(
        &self,
        container: &str,
        bucket: u32,
        cancel: &CancellationToken,
    ) -> Result<CompactedRead<T>> {
        ensure_not_cancelled(cancel)?;
        let header = self.headers.get::<T>()?;
        let path = self.compacted_path(container, bucket);
        Ok(match self.download::<T>(&path, &header).await? {
            Some(blob) => CompactedRead::Found(blob.records),
            None => CompactedRead::NotFound,
        })
    }

    /// Buckets that have a compacted blob, ascending.
    pub async fn get_compacted_buckets(
        &self,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>> {
        ensure_not_cancelled(cancel)?;
        let prefix = Path::from(container);
        let objects: Vec<_> = self.blobs.list(Some(&prefix)).try_collect().await?;
        let mut buckets: Vec<u32> = objects
            .iter()
            .filter_map(|meta| meta.location.filename().and_then(parse_blob_name))
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        Ok(buckets)
    }

    pub fn get_compacted_blob_url(&self, container: &str, bucket: u32) -> String {
        let base = &self.config.blob_base_url;
        let path = self.compacted_path(container, bucket);
        if base.ends_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    fn compacted_path(&self, container: &str, bucket: u32) -> Path {
        let extension = if self.config.use_gzip { "csv.gz" } else { "csv" };
        Path::from(format!("{container}/{BLOB_PREFIX}{bucket}.{extension}"))
    }

    async fn download<T: CsvRecord>(
        &self,
        path: &Path,
        header: &str,
    ) -> Result<Option<StoredBlob<T>>> {
        let result = match self.blobs.get(path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let gzipped = attribute(&result.attributes, &Attribute::ContentEncoding) == Some("gzip");
        let content_sha256 = attribute(
            &result.attributes,
            &Attribute::Metadata(CONTENT_SHA256_KEY.into()),
        )
        .map(str::to_string);

        let body = result.bytes().await?;
        let size = body.len();
        let raw = if gzipped { gunzip(&body)? } else { body.to_vec() };
        let records = read_csv(
            header,
            &raw,
            self.config.initial_csv_buffer_size,
            self.config.max_csv_buffer_size,
        )?;

        Ok(Some(StoredBlob {
            records,
            version,
            content_sha256,
            size,
        }))
    }
}

fn attribute<'a>(attributes: &'a Attributes, key: &Attribute) -> Option<&'a str> {
    attributes.get(key).map(|value| value.as_ref())
}

/// Bucket number of a blob named `compact_{bucket}.csv[.gz]`.
fn parse_blob_name(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(BLOB_PREFIX)?;
    let number = rest
        .strip_suffix(".csv.gz")
        .or_else(|| rest.strip_suffix(".csv"))?;
    number.parse().ok()
}

fn check_duplicates<T: CsvRecord>(records: &[T]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut count = 0;
    let mut sample = Vec::new();
    for key in records.iter().filter_map(T::record_key) {
        if seen.contains(&key) {
            count += 1;
            if sample.len() < MAX_DUPLICATE_SAMPLES {
                sample.push(key);
            }
        } else {
            seen.insert(key);
        }
    }
    if count > 0 {
        return Err(Error::DuplicateRecords { count, sample });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Keyed(String);

    impl CsvRecord for Keyed {
        const HEADER: &'static [&'static str] = &["Key"];

        fn bucket_key(&self) -> String {
            self.0.clone()
        }

        fn record_key(&self) -> Option<String> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn test_parse_blob_name() {
        assert_eq!(parse_blob_name("compact_17.csv.gz"), Some(17));
        assert_eq!(parse_blob_name("compact_0.csv"), Some(0));
        assert_eq!(parse_blob_name("compact_x.csv"), None);
        assert_eq!(parse_blob_name("latest_1.csv"), None);
        assert_eq!(parse_blob_name("compact_1.json"), None);
    }

    #[test]
    fn test_check_duplicates() {
        let unique: Vec<_> = ["a", "b", "c"].iter().map(|k| Keyed(k.to_string())).collect();
        assert!(check_duplicates(&unique).is_ok());

        let dupes: Vec<_> = ["a", "b", "a", "a", "b"]
            .iter()
            .map(|k| Keyed(k.to_string()))
            .collect();
        match check_duplicates(&dupes) {
            Err(Error::DuplicateRecords { count, sample }) => {
                assert_eq!(count, 3);
                assert_eq!(sample, vec!["a", "a", "b"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
