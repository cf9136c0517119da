//! Wide Entity Service
//!
//! Reads and writes [`WideEntity`]s on top of a [`TableStore`].
//!
//! ## Write Path
//!
//! ```text
//! execute_batch(ops)
//!      │
//!      ├─► plan each op: segments + actions + size   (InsertOrReplace reads the current head)
//!      │
//!      ├─► plan_transactions: recursive halving      (RequestTooLarge if impossible)
//!      │
//!      └─► submit each transaction in order          (cancellation checked in between)
//! ```
//!
//! Actions per operation:
//!
//! | Operation | Segment 0 | Other new segments | Old surplus segments |
//! |---|---|---|---|
//! | Insert | Add | Add | - |
//! | Replace | UpdateReplace(If-Match: etag) | UpsertReplace | Delete(If-Match: *) |
//! | Delete | Delete(If-Match: etag) | - | Delete(If-Match: *) |
//!
//! ## Read Path
//!
//! Range queries over segment keys, grouped per entity and verified against the
//! segment count. Reads without data only fetch the count property.

use std::sync::Arc;

use bytes::Bytes;
use harvest_observability::metrics;
use harvest_table::{IfMatch, TableAction, TableQuery, TableStore};
use tokio_util::sync::CancellationToken;

use super::batch::{plan_transactions, BatchLimits, PlannedResult, PlannedWrite};
use super::segment::{
    assemble, build_segments, data_range, entity_range, group_rows, head_range, key_size,
    segment_row_key, stored_size, validate_keys,
};
use super::{WideEntity, WideEntityOperation};
use crate::config::{WideEntityConfig, SEGMENT_COUNT_PROPERTY};
use crate::error::{Error, Result};
use crate::ensure_not_cancelled;

pub struct WideEntityService {
    store: Arc<dyn TableStore>,
    config: WideEntityConfig,
}

impl WideEntityService {
    pub fn new(store: Arc<dyn TableStore>, config: WideEntityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &WideEntityConfig {
        &self.config
    }

    /// Largest payload accepted by the write operations.
    pub fn max_total_data_size(&self) -> usize {
        self.config.max_total_data_size()
    }

    pub async fn create_table(&self, table: &str, cancel: &CancellationToken) -> Result<()> {
        ensure_not_cancelled(cancel)?;
        self.store.create_table(table).await?;
        Ok(())
    }

    pub async fn delete_table(&self, table: &str, cancel: &CancellationToken) -> Result<()> {
        ensure_not_cancelled(cancel)?;
        self.store.delete_table(table).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Retrieve one entity, or `None` if it does not exist.
    pub async fn retrieve(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        include_data: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<WideEntity>> {
        validate_keys(partition_key, row_key)?;
        let (min, max) = if include_data {
            entity_range(row_key)
        } else {
            let head = segment_row_key(row_key, 0);
            (head.clone(), head)
        };
        let query = self.query(partition_key, min, max, include_data);
        let entities = self
            .query_entities(table, &query, include_data, Some((row_key, row_key)), cancel)
            .await?;
        Ok(entities.into_iter().next())
    }

    /// Retrieve every entity of a partition whose row key is in `[min_row_key, max_row_key]`.
    ///
    /// Entities come back in segment key order (`{row_key}~00`), not row key order:
    /// `"a0"` precedes `"a"` because `'0' < '~'`. Fixed-width keys sort the same
    /// either way.
    pub async fn retrieve_range(
        &self,
        table: &str,
        partition_key: &str,
        min_row_key: &str,
        max_row_key: &str,
        include_data: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<WideEntity>> {
        validate_keys(partition_key, min_row_key)?;
        validate_keys(partition_key, max_row_key)?;
        if min_row_key > max_row_key {
            return Ok(Vec::new());
        }
        let (min, max) = if include_data {
            data_range(min_row_key, max_row_key)
        } else {
            head_range(min_row_key, max_row_key)
        };
        let query = self.query(partition_key, min, max, include_data);
        self.query_entities(
            table,
            &query,
            include_data,
            Some((min_row_key, max_row_key)),
            cancel,
        )
        .await
    }

    /// Retrieve every entity of a partition, in segment key order like
    /// [`Self::retrieve_range`].
    pub async fn retrieve_partition(
        &self,
        table: &str,
        partition_key: &str,
        include_data: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<WideEntity>> {
        let query = with_projection(TableQuery::partition(partition_key), include_data);
        self.query_entities(table, &query, include_data, None, cancel)
            .await
    }

    /// Retrieve every entity of the table.
    pub async fn retrieve_all(
        &self,
        table: &str,
        include_data: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<WideEntity>> {
        let query = with_projection(TableQuery::all(), include_data);
        self.query_entities(table, &query, include_data, None, cancel)
            .await
    }

    fn query(
        &self,
        partition_key: &str,
        min: String,
        max: String,
        include_data: bool,
    ) -> TableQuery {
        with_projection(
            TableQuery::partition(partition_key).with_row_key_range(min, max),
            include_data,
        )
    }

    async fn query_entities(
        &self,
        table: &str,
        query: &TableQuery,
        include_data: bool,
        row_key_range: Option<(&str, &str)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WideEntity>> {
        let mut rows = Vec::new();
        let mut continuation = None;
        loop {
            ensure_not_cancelled(cancel)?;
            let page = self
                .store
                .query_page(table, query, continuation.as_ref(), self.config.max_per_page)
                .await?;
            rows.extend(page.rows);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        let row_count = rows.len();
        let mut entities = Vec::new();
        for (row_key, segments) in group_rows(rows)? {
            let in_range = row_key_range
                .map_or(true, |(min, max)| row_key.as_str() >= min && row_key.as_str() <= max);
            if in_range {
                entities.push(assemble(row_key, segments, include_data)?);
            }
        }

        tracing::debug!(
            table = %table,
            partition_key = ?query.partition_key,
            rows = row_count,
            entities = entities.len(),
            include_data,
            "Retrieved wide entities"
        );
        Ok(entities)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Insert a new entity.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists`: the identity is taken
    /// - `ContentTooLarge`: `content` exceeds [`Self::max_total_data_size`]
    pub async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        content: Bytes,
        cancel: &CancellationToken,
    ) -> Result<WideEntity> {
        let op = WideEntityOperation::insert(partition_key, row_key, content);
        self.execute_single(table, op, cancel).await
    }

    /// Insert an entity, overwriting whatever is stored under its identity.
    pub async fn insert_or_replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        content: Bytes,
        cancel: &CancellationToken,
    ) -> Result<WideEntity> {
        let op = WideEntityOperation::insert_or_replace(partition_key, row_key, content);
        self.execute_single(table, op, cancel).await
    }

    /// Replace `existing` with `content`.
    ///
    /// # Errors
    ///
    /// - `NotFound`: the entity was deleted since `existing` was read
    /// - `PreconditionFailed`: the entity was changed since `existing` was read
    pub async fn replace(
        &self,
        table: &str,
        existing: &WideEntity,
        content: Bytes,
        cancel: &CancellationToken,
    ) -> Result<WideEntity> {
        let op = WideEntityOperation::replace(existing.clone(), content);
        self.execute_single(table, op, cancel).await
    }

    /// Delete every segment of `existing`, conditional on its etag.
    pub async fn delete(
        &self,
        table: &str,
        existing: &WideEntity,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let op = WideEntityOperation::delete(existing.clone());
        self.execute_batch(table, vec![op], false, cancel).await?;
        Ok(())
    }

    /// Insert `content` under a row key from `keygen`, drawing a fresh key when the
    /// previous one is already taken.
    ///
    /// Gives up with the last `AlreadyExists` after `max_generated_key_attempts`.
    pub async fn insert_with_generated_key<F>(
        &self,
        table: &str,
        partition_key: &str,
        mut keygen: F,
        content: Bytes,
        cancel: &CancellationToken,
    ) -> Result<WideEntity>
    where
        F: FnMut() -> String + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            let row_key = keygen();
            match self
                .insert(table, partition_key, &row_key, content.clone(), cancel)
                .await
            {
                Err(Error::AlreadyExists { .. })
                    if attempt + 1 < self.config.max_generated_key_attempts =>
                {
                    tracing::warn!(
                        table = %table,
                        partition_key = %partition_key,
                        row_key = %row_key,
                        attempt = attempt + 1,
                        "Generated row key already taken, retrying with a new key"
                    );
                    metrics::APPEND_KEY_CONFLICTS_TOTAL
                        .with_label_values(&[table])
                        .inc();
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn execute_single(
        &self,
        table: &str,
        op: WideEntityOperation,
        cancel: &CancellationToken,
    ) -> Result<WideEntity> {
        self.execute_batch(table, vec![op], false, cancel)
            .await?
            .pop()
            .flatten()
            .ok_or_else(|| Error::InvariantViolation("write produced no entity".to_string()))
    }

    /// Apply `operations` to one partition as one or more atomic transactions.
    ///
    /// Returns one entry per operation in order: the written entity, or `None` for a
    /// delete. With `allow_batch_splits` a batch too large for one transaction is
    /// split by recursive halving; each operation still commits atomically, but a
    /// failure in a later transaction leaves the earlier ones committed.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: mixed partition keys or two operations on one entity
    /// - `RequestTooLarge`: the batch cannot be made to fit; nothing was written
    /// - any error of the individual operations
    pub async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<WideEntityOperation>,
        allow_batch_splits: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<WideEntity>>> {
        let Some(first) = operations.first() else {
            return Ok(Vec::new());
        };
        let partition_key = first.partition_key().to_string();
        let mut row_keys = std::collections::HashSet::new();
        for op in &operations {
            if op.partition_key() != partition_key {
                return Err(Error::InvalidArgument(format!(
                    "batch mixes partition keys '{partition_key}' and '{}'",
                    op.partition_key()
                )));
            }
            if !row_keys.insert(op.row_key().to_string()) {
                return Err(Error::InvalidArgument(format!(
                    "batch contains more than one operation on '{}'",
                    op.row_key()
                )));
            }
        }

        let operation_count = operations.len();
        let mut writes = Vec::with_capacity(operation_count);
        for op in operations {
            writes.push(self.plan_write(table, op, cancel).await?);
        }

        let ranges = plan_transactions(
            &writes,
            BatchLimits {
                max_operations: self.config.max_batch_operations,
                max_data_size: self.config.max_batch_data_size,
                allow_splits: allow_batch_splits,
                max_split_depth: self.config.max_split_depth,
            },
        )?;
        metrics::WIDE_ENTITY_BATCH_TRANSACTIONS
            .with_label_values(&[table])
            .observe(ranges.len() as f64);
        if ranges.len() > 1 {
            tracing::debug!(
                table = %table,
                partition_key = %partition_key,
                operations = operation_count,
                transactions = ranges.len(),
                "Split wide entity batch"
            );
        }

        let mut results = Vec::with_capacity(operation_count);
        let mut pending = writes.into_iter();
        for range in ranges {
            ensure_not_cancelled(cancel)?;
            let batch: Vec<PlannedWrite> = pending.by_ref().take(range.len()).collect();
            let sizes: Vec<usize> = batch.iter().map(|w| w.actions.len()).collect();
            let mut outcomes = Vec::with_capacity(batch.len());
            let mut actions = Vec::with_capacity(sizes.iter().sum());
            for write in batch {
                actions.extend(write.actions);
                outcomes.push(write.result);
            }

            let etags = self.store.submit_transaction(table, actions).await?;

            let mut offset = 0;
            for (outcome, size) in outcomes.into_iter().zip(sizes) {
                results.push(self.complete(table, outcome, etags.get(offset).cloned().flatten())?);
                offset += size;
            }
        }
        Ok(results)
    }

    fn complete(
        &self,
        table: &str,
        outcome: PlannedResult,
        etag: Option<String>,
    ) -> Result<Option<WideEntity>> {
        match outcome {
            PlannedResult::Deleted => Ok(None),
            PlannedResult::Written {
                partition_key,
                row_key,
                segment_count,
                content,
            } => {
                let etag = etag.ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "no etag returned for {partition_key}/{row_key}"
                    ))
                })?;
                metrics::WIDE_ENTITY_BYTES_WRITTEN_TOTAL
                    .with_label_values(&[table])
                    .inc_by(content.len() as u64);
                let chunks = if content.is_empty() {
                    Vec::new()
                } else {
                    vec![content]
                };
                Ok(Some(WideEntity::new(
                    partition_key,
                    row_key,
                    etag,
                    None,
                    segment_count,
                    Some(chunks),
                )))
            }
        }
    }

    async fn plan_write(
        &self,
        table: &str,
        op: WideEntityOperation,
        cancel: &CancellationToken,
    ) -> Result<PlannedWrite> {
        match op {
            WideEntityOperation::Insert {
                partition_key,
                row_key,
                content,
            } => self.plan_put(partition_key, row_key, content, None),
            WideEntityOperation::InsertOrReplace {
                partition_key,
                row_key,
                content,
            } => {
                self.check_content(&partition_key, &row_key, &content)?;
                let existing = self
                    .retrieve(table, &partition_key, &row_key, false, cancel)
                    .await?;
                self.plan_put(partition_key, row_key, content, existing.as_ref())
            }
            WideEntityOperation::Replace { existing, content } => self.plan_put(
                existing.partition_key().to_string(),
                existing.row_key().to_string(),
                content,
                Some(&existing),
            ),
            WideEntityOperation::Delete { existing } => {
                let pk = existing.partition_key();
                let rk = existing.row_key();
                let actions: Vec<TableAction> = (0..existing.segment_count())
                    .map(|index| TableAction::Delete {
                        partition_key: pk.to_string(),
                        row_key: segment_row_key(rk, index),
                        if_match: if index == 0 {
                            IfMatch::ETag(existing.etag().to_string())
                        } else {
                            IfMatch::Any
                        },
                    })
                    .collect();
                let data_size = actions
                    .iter()
                    .map(|a| key_size(a.partition_key(), a.row_key()))
                    .sum();
                Ok(PlannedWrite {
                    actions,
                    data_size,
                    result: PlannedResult::Deleted,
                })
            }
        }
    }

    fn check_content(&self, partition_key: &str, row_key: &str, content: &Bytes) -> Result<()> {
        validate_keys(partition_key, row_key)?;
        let limit = self.max_total_data_size();
        if content.len() > limit {
            return Err(Error::ContentTooLarge {
                size: content.len(),
                limit,
            });
        }
        Ok(())
    }

    /// Actions writing `content`, replacing `existing` when given.
    fn plan_put(
        &self,
        partition_key: String,
        row_key: String,
        content: Bytes,
        existing: Option<&WideEntity>,
    ) -> Result<PlannedWrite> {
        self.check_content(&partition_key, &row_key, &content)?;
        let segments = build_segments(&partition_key, &row_key, &content, self.config.segment_size);
        let segment_count = segments.len();
        let mut data_size: usize = segments.iter().map(stored_size).sum();

        let mut actions: Vec<TableAction> = match existing {
            None => segments.into_iter().map(TableAction::Add).collect(),
            Some(existing) => segments
                .into_iter()
                .enumerate()
                .map(|(index, row)| {
                    if index == 0 {
                        TableAction::UpdateReplace {
                            row,
                            if_match: IfMatch::ETag(existing.etag().to_string()),
                        }
                    } else {
                        TableAction::UpsertReplace(row)
                    }
                })
                .collect(),
        };
        if let Some(existing) = existing {
            for index in segment_count..existing.segment_count() {
                let surplus = segment_row_key(&row_key, index);
                data_size += key_size(&partition_key, &surplus);
                actions.push(TableAction::Delete {
                    partition_key: partition_key.clone(),
                    row_key: surplus,
                    if_match: IfMatch::Any,
                });
            }
        }

        Ok(PlannedWrite {
            actions,
            data_size,
            result: PlannedResult::Written {
                partition_key,
                row_key,
                segment_count,
                content,
            },
        })
    }
}

fn with_projection(query: TableQuery, include_data: bool) -> TableQuery {
    if include_data {
        query
    } else {
        query.with_select([SEGMENT_COUNT_PROPERTY])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_table::InMemoryTableStore;

    fn small_config() -> WideEntityConfig {
        WideEntityConfig {
            segment_size: 1024,
            max_batch_data_size: 100_000,
            max_segments_per_entity: 32,
            ..Default::default()
        }
    }

    async fn service(config: WideEntityConfig) -> (WideEntityService, Arc<InMemoryTableStore>) {
        let store = Arc::new(InMemoryTableStore::new());
        let service = WideEntityService::new(store.clone(), config).unwrap();
        service
            .create_table("t", &CancellationToken::new())
            .await
            .unwrap();
        (service, store)
    }

    #[tokio::test]
    async fn test_replace_removes_surplus_segments() {
        let (service, store) = service(small_config()).await;
        let cancel = CancellationToken::new();

        let first = service
            .insert("t", "p", "r", Bytes::from(vec![1u8; 3000]), &cancel)
            .await
            .unwrap();
        assert_eq!(first.segment_count(), 3);
        assert_eq!(store.row_count("t").await, Some(3));

        let second = service
            .replace("t", &first, Bytes::from_static(b"short"), &cancel)
            .await
            .unwrap();
        assert_eq!(second.segment_count(), 1);
        assert_ne!(second.etag(), first.etag());
        assert_eq!(store.row_count("t").await, Some(1));

        let read = service
            .retrieve("t", "p", "r", true, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.to_bytes().unwrap(), Bytes::from_static(b"short"));
        assert_eq!(read.etag(), second.etag());
    }

    #[tokio::test]
    async fn test_insert_or_replace_creates_then_overwrites() {
        let (service, _) = service(small_config()).await;
        let cancel = CancellationToken::new();

        service
            .insert_or_replace("t", "p", "r", Bytes::from_static(b"one"), &cancel)
            .await
            .unwrap();
        service
            .insert_or_replace("t", "p", "r", Bytes::from(vec![2u8; 2500]), &cancel)
            .await
            .unwrap();

        let read = service
            .retrieve("t", "p", "r", true, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.segment_count(), 3);
        assert_eq!(read.to_bytes().unwrap(), Bytes::from(vec![2u8; 2500]));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_backend() {
        let (service, store) = service(small_config()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service
            .insert("t", "p", "r", Bytes::from_static(b"x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(store.row_count("t").await, Some(0));
    }

    #[tokio::test]
    async fn test_batch_rejects_mixed_partitions_and_duplicates() {
        let (service, _) = service(small_config()).await;
        let cancel = CancellationToken::new();

        let mixed = vec![
            WideEntityOperation::insert("p", "a", Bytes::new()),
            WideEntityOperation::insert("q", "b", Bytes::new()),
        ];
        assert!(matches!(
            service.execute_batch("t", mixed, true, &cancel).await,
            Err(Error::InvalidArgument(_))
        ));

        let duplicate = vec![
            WideEntityOperation::insert("p", "a", Bytes::new()),
            WideEntityOperation::insert("p", "a", Bytes::new()),
        ];
        assert!(matches!(
            service.execute_batch("t", duplicate, true, &cancel).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_generated_key_conflicts_are_retried() {
        let (service, _) = service(small_config()).await;
        let cancel = CancellationToken::new();
        service
            .insert("t", "p", "taken", Bytes::new(), &cancel)
            .await
            .unwrap();

        let mut keys = vec!["fresh", "taken"];
        let entity = service
            .insert_with_generated_key(
                "t",
                "p",
                move || keys.pop().unwrap_or("fallback").to_string(),
                Bytes::from_static(b"data"),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(entity.row_key(), "fresh");
    }

    #[tokio::test]
    async fn test_generated_key_attempts_are_bounded() {
        let (service, _) = service(small_config()).await;
        let cancel = CancellationToken::new();
        service
            .insert("t", "p", "taken", Bytes::new(), &cancel)
            .await
            .unwrap();

        let err = service
            .insert_with_generated_key(
                "t",
                "p",
                || "taken".to_string(),
                Bytes::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }
}
