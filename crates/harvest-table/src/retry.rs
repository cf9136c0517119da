//! Retrying Table Store
//!
//! Decorator that retries transient backend failures with exponential backoff, so the
//! layers above only ever see logical outcomes.
//!
//! ## No-op retries
//!
//! A transient failure (timeout, dropped connection) leaves the outcome of a write
//! unknown: the backend may have committed it. Retrying such a write can then fail with
//! a conflict caused by our own first attempt. To tell the two apart every written row is
//! stamped with a per-request client id:
//!
//! ```text
//!   attempt 1: Add(p/r, ClientRequestId=abc) -> Transient (actually committed)
//!   attempt 2: Add(p/r, ClientRequestId=abc) -> EntityAlreadyExists
//!              read back p/r: ClientRequestId == abc  => success
//! ```
//!
//! When a retried transaction fails with a conflict, every affected row is read back.
//! If each written row carries this request's id and each deleted row is gone, the
//! earlier attempt is treated as the successful one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;

use harvest_core::unique_id;
use harvest_observability::metrics;

use crate::config::RetryConfig;
use crate::error::Result;
use crate::types::{ContinuationToken, PropertyValue, QueryPage, TableAction, TableQuery};
use crate::TableStore;

/// Property stamped on every row written through [`RetryingTableStore`].
pub const CLIENT_REQUEST_ID_PROPERTY: &str = "ClientRequestId";

/// Length of the client request id value (simple-format UUID).
pub const CLIENT_REQUEST_ID_LEN: usize = 32;

const READ_BACK_PAGE_SIZE: usize = 1000;

pub struct RetryingTableStore<S: TableStore> {
    inner: S,
    config: RetryConfig,
}

impl<S: TableStore> RetryingTableStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    async fn with_retries<T, F, Fut>(&self, table: &str, operation: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(
                        table = %table,
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient table failure, retrying"
                    );
                    metrics::TABLE_TRANSIENT_RETRIES_TOTAL
                        .with_label_values(&[table])
                        .inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Check whether an earlier attempt of `actions` stamped with `request_id` committed.
    /// Returns the etags that attempt produced.
    async fn committed_earlier(
        &self,
        table: &str,
        actions: &[TableAction],
        request_id: &str,
    ) -> Result<Option<Vec<Option<String>>>> {
        let Some(first) = actions.first() else {
            return Ok(None);
        };

        let min = actions.iter().map(|a| a.row_key()).min().unwrap_or_default();
        let max = actions.iter().map(|a| a.row_key()).max().unwrap_or_default();
        let query = TableQuery::partition(first.partition_key()).with_row_key_range(min, max);
        let rows = self
            .inner
            .query_all(table, &query, READ_BACK_PAGE_SIZE)
            .await?;
        let by_key: HashMap<&str, _> = rows.iter().map(|r| (r.row_key.as_str(), r)).collect();

        let mut etags = Vec::with_capacity(actions.len());
        for action in actions {
            let current = by_key.get(action.row_key());
            match (action.row(), current) {
                (Some(_), Some(row)) => {
                    let ours = row
                        .get(CLIENT_REQUEST_ID_PROPERTY)
                        .and_then(PropertyValue::as_str)
                        == Some(request_id);
                    if !ours {
                        return Ok(None);
                    }
                    etags.push(row.etag.clone());
                }
                (None, None) => etags.push(None),
                _ => return Ok(None),
            }
        }

        Ok(Some(etags))
    }
}

#[async_trait]
impl<S: TableStore> TableStore for RetryingTableStore<S> {
    async fn create_table(&self, table: &str) -> Result<()> {
        self.with_retries(table, "create_table", move || self.inner.create_table(table))
            .await
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        self.with_retries(table, "delete_table", move || self.inner.delete_table(table))
            .await
    }

    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
        max_per_page: usize,
    ) -> Result<QueryPage> {
        self.with_retries(table, "query_page", move || {
            self.inner
                .query_page(table, query, continuation, max_per_page)
        })
        .await
    }

    async fn submit_transaction(
        &self,
        table: &str,
        mut actions: Vec<TableAction>,
    ) -> Result<Vec<Option<String>>> {
        let request_id = unique_id();
        for action in &mut actions {
            if let Some(row) = action.row_mut() {
                row.set(
                    CLIENT_REQUEST_ID_PROPERTY,
                    PropertyValue::String(request_id.clone()),
                );
            }
        }

        let partition_key = actions
            .first()
            .map(|a| a.partition_key().to_string())
            .unwrap_or_default();
        let mut attempt: u32 = 0;
        loop {
            let result = self.inner.submit_transaction(table, actions.clone()).await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.outcome_label(),
            };
            metrics::TABLE_TRANSACTIONS_TOTAL
                .with_label_values(&[table, outcome])
                .inc();

            match result {
                Ok(etags) => return Ok(etags),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(
                        table = %table,
                        partition_key = %partition_key,
                        actions = actions.len(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient transaction failure, retrying"
                    );
                    metrics::TABLE_TRANSIENT_RETRIES_TOTAL
                        .with_label_values(&[table])
                        .inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_conflict() && attempt > 0 => {
                    match self.committed_earlier(table, &actions, &request_id).await? {
                        Some(etags) => {
                            tracing::info!(
                                table = %table,
                                partition_key = %partition_key,
                                client_request_id = %request_id,
                                "Conflict on retry was caused by an earlier committed attempt"
                            );
                            metrics::TABLE_NOOP_RETRIES_TOTAL
                                .with_label_values(&[table])
                                .inc();
                            return Ok(etags);
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
