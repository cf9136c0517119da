//! In-Memory Table Store
//!
//! A process-local [`TableStore`] that enforces the same transactional contract and
//! size limits as the remote table service:
//!
//! - transactions are all-or-nothing, single partition, at most `max_batch_operations`
//! - every row is checked against `max_entity_bytes` and `max_binary_property_bytes`
//! - the encoded request is checked against `max_request_bytes`
//! - every write assigns a fresh etag and timestamp
//!
//! Tables are `BTreeMap`s keyed by `(partition_key, row_key)`, so queries naturally
//! return rows in key order.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::config::TableLimits;
use crate::error::{Result, TableError};
use crate::size::{entity_size, request_size};
use crate::types::{
    ContinuationToken, IfMatch, PropertyValue, QueryPage, TableAction, TableQuery, TableRow,
};
use crate::TableStore;

type RowKey = (String, String);
type Table = BTreeMap<RowKey, TableRow>;

pub struct InMemoryTableStore {
    limits: TableLimits,
    tables: RwLock<HashMap<String, Table>>,
    etag_counter: AtomicU64,
}

impl Default for InMemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::with_limits(TableLimits::default())
    }

    pub fn with_limits(limits: TableLimits) -> Self {
        Self {
            limits,
            tables: RwLock::new(HashMap::new()),
            etag_counter: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> &TableLimits {
        &self.limits
    }

    /// Number of rows in `table`, or `None` if the table does not exist.
    pub async fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.read().await.get(table).map(|rows| rows.len())
    }

    fn next_etag(&self) -> String {
        let n = self.etag_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("W/\"{n:016x}\"")
    }

    fn validate(&self, actions: &[TableAction]) -> Result<()> {
        let Some(first) = actions.first() else {
            return Err(TableError::InvalidInput(
                "a transaction needs at least one action".to_string(),
            ));
        };

        if actions.len() > self.limits.max_batch_operations {
            return Err(TableError::InvalidInput(format!(
                "transaction has {} actions, limit {}",
                actions.len(),
                self.limits.max_batch_operations
            )));
        }

        let partition_key = first.partition_key();
        let mut seen = HashSet::with_capacity(actions.len());
        for action in actions {
            if action.partition_key() != partition_key {
                return Err(TableError::InvalidInput(format!(
                    "transaction spans partitions '{}' and '{}'",
                    partition_key,
                    action.partition_key()
                )));
            }
            if !seen.insert(action.row_key()) {
                return Err(TableError::InvalidInput(format!(
                    "row key '{}' appears more than once in a transaction",
                    action.row_key()
                )));
            }

            if let Some(row) = action.row() {
                self.validate_row(row)?;
            }
        }

        let size = request_size(actions);
        if size > self.limits.max_request_bytes {
            return Err(TableError::RequestBodyTooLarge {
                size,
                limit: self.limits.max_request_bytes,
            });
        }

        Ok(())
    }

    fn validate_row(&self, row: &TableRow) -> Result<()> {
        for (name, value) in &row.properties {
            if let PropertyValue::Binary(bytes) = value {
                if bytes.len() > self.limits.max_binary_property_bytes {
                    return Err(TableError::InvalidInput(format!(
                        "property '{}' of {}/{} is {} bytes, limit {}",
                        name,
                        row.partition_key,
                        row.row_key,
                        bytes.len(),
                        self.limits.max_binary_property_bytes
                    )));
                }
            }
        }

        let size = entity_size(row);
        if size > self.limits.max_entity_bytes {
            return Err(TableError::EntityTooLarge {
                partition_key: row.partition_key.clone(),
                row_key: row.row_key.clone(),
                size,
                limit: self.limits.max_entity_bytes,
            });
        }

        Ok(())
    }
}

fn check_if_match(existing: &TableRow, if_match: &IfMatch) -> Result<()> {
    match if_match {
        IfMatch::Any => Ok(()),
        IfMatch::ETag(expected) => {
            let actual = existing.etag.clone().unwrap_or_default();
            if *expected == actual {
                Ok(())
            } else {
                Err(TableError::PreconditionFailed {
                    partition_key: existing.partition_key.clone(),
                    row_key: existing.row_key.clone(),
                    expected: expected.clone(),
                    actual,
                })
            }
        }
    }
}

fn check_action(rows: &Table, action: &TableAction) -> Result<()> {
    let key = (
        action.partition_key().to_string(),
        action.row_key().to_string(),
    );
    let existing = rows.get(&key);
    let not_found = || TableError::EntityNotFound {
        partition_key: key.0.clone(),
        row_key: key.1.clone(),
    };

    match action {
        TableAction::Add(_) => match existing {
            Some(_) => Err(TableError::EntityAlreadyExists {
                partition_key: key.0.clone(),
                row_key: key.1.clone(),
            }),
            None => Ok(()),
        },
        TableAction::UpsertReplace(_) => Ok(()),
        TableAction::UpdateReplace { if_match, .. } | TableAction::Delete { if_match, .. } => {
            let existing = existing.ok_or_else(not_found)?;
            check_if_match(existing, if_match)
        }
    }
}

fn project(row: &TableRow, select: Option<&Vec<String>>) -> TableRow {
    let mut out = row.clone();
    if let Some(names) = select {
        out.properties.retain(|name, _| names.iter().any(|n| n == name));
    }
    out
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn create_table(&self, table: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        self.tables.write().await.remove(table);
        Ok(())
    }

    async fn query_page(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
        max_per_page: usize,
    ) -> Result<QueryPage> {
        if max_per_page == 0 {
            return Err(TableError::InvalidInput(
                "max_per_page must be greater than zero".to_string(),
            ));
        }

        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;

        let mut lower: RowKey = match &query.partition_key {
            Some(pk) => {
                let min = query
                    .row_key_range
                    .as_ref()
                    .map(|(min, _)| min.clone())
                    .unwrap_or_default();
                (pk.clone(), min)
            }
            None => (String::new(), String::new()),
        };
        if let Some(token) = continuation {
            let resume = (
                token.next_partition_key.clone(),
                token.next_row_key.clone(),
            );
            if resume > lower {
                lower = resume;
            }
        }

        let mut page = QueryPage::default();
        for ((pk, rk), row) in rows.range(lower..) {
            if let Some(wanted) = &query.partition_key {
                if pk != wanted {
                    break;
                }
                if let Some((_, max)) = &query.row_key_range {
                    if rk > max {
                        break;
                    }
                }
            }
            if !query.matches(pk, rk) {
                continue;
            }
            if page.rows.len() == max_per_page {
                page.continuation = Some(ContinuationToken {
                    next_partition_key: pk.clone(),
                    next_row_key: rk.clone(),
                });
                break;
            }
            page.rows.push(project(row, query.select.as_ref()));
        }

        Ok(page)
    }

    async fn submit_transaction(
        &self,
        table: &str,
        actions: Vec<TableAction>,
    ) -> Result<Vec<Option<String>>> {
        self.validate(&actions)?;

        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;

        // Row keys are distinct, so checking every action up front is equivalent to
        // applying them one by one and rolling back on the first failure.
        for action in &actions {
            check_action(rows, action)?;
        }

        let now = Utc::now();
        let mut etags = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                TableAction::Add(mut row)
                | TableAction::UpdateReplace { mut row, .. }
                | TableAction::UpsertReplace(mut row) => {
                    let etag = self.next_etag();
                    row.etag = Some(etag.clone());
                    row.timestamp = Some(now);
                    rows.insert((row.partition_key.clone(), row.row_key.clone()), row);
                    etags.push(Some(etag));
                }
                TableAction::Delete {
                    partition_key,
                    row_key,
                    ..
                } => {
                    rows.remove(&(partition_key, row_key));
                    etags.push(None);
                }
            }
        }

        Ok(etags)
    }
}
