//! Table Type Definitions
//!
//! This module defines the row, action and query model shared by every table backend.
//!
//! ## Types Overview
//!
//! ### TableRow
//! One physical row: a `(partition_key, row_key)` identity, an opaque etag and timestamp
//! assigned by the backend on write, and a map of typed properties.
//!
//! ### TableAction
//! One operation inside an atomic transaction. All actions of a transaction share a
//! partition key.
//!
//! ### TableQuery / QueryPage
//! A filter over one or all partitions with an optional inclusive row key range and an
//! optional property projection. Results come back page by page, sorted by
//! `(partition_key, row_key)`, with a continuation token for the next page.
//!
//! ## Design Decisions
//!
//! - Properties live in a `BTreeMap` so iteration (and size accounting) is deterministic
//! - Binary values are `bytes::Bytes` so segments can be sliced from payloads without copying
//! - `etag` and `timestamp` are `None` on rows that have not been written yet

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int32(i32),
    Int64(i64),
    String(String),
    Binary(Bytes),
}

impl PropertyValue {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            PropertyValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            PropertyValue::Binary(v) => Some(v),
            _ => None,
        }
    }
}

/// One physical table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,

    /// Version token assigned by the backend; `None` before the row is written.
    pub etag: Option<String>,

    /// Last modification time assigned by the backend.
    pub timestamp: Option<DateTime<Utc>>,

    pub properties: BTreeMap<String, PropertyValue>,
}

impl TableRow {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            timestamp: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.properties.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.partition_key, &self.row_key)
    }
}

/// Optimistic concurrency precondition for updates and deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfMatch {
    /// Apply regardless of the current version (the row must still exist).
    Any,
    /// Apply only if the row's current etag equals this value.
    ETag(String),
}

/// One operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableAction {
    /// Insert; fails if the key is occupied.
    Add(TableRow),

    /// Replace all properties of an existing row.
    UpdateReplace { row: TableRow, if_match: IfMatch },

    /// Insert or replace unconditionally.
    UpsertReplace(TableRow),

    /// Delete an existing row.
    Delete {
        partition_key: String,
        row_key: String,
        if_match: IfMatch,
    },
}

impl TableAction {
    pub fn partition_key(&self) -> &str {
        match self {
            TableAction::Add(row)
            | TableAction::UpdateReplace { row, .. }
            | TableAction::UpsertReplace(row) => &row.partition_key,
            TableAction::Delete { partition_key, .. } => partition_key,
        }
    }

    pub fn row_key(&self) -> &str {
        match self {
            TableAction::Add(row)
            | TableAction::UpdateReplace { row, .. }
            | TableAction::UpsertReplace(row) => &row.row_key,
            TableAction::Delete { row_key, .. } => row_key,
        }
    }

    /// The row written by this action, if any.
    pub fn row(&self) -> Option<&TableRow> {
        match self {
            TableAction::Add(row)
            | TableAction::UpdateReplace { row, .. }
            | TableAction::UpsertReplace(row) => Some(row),
            TableAction::Delete { .. } => None,
        }
    }

    pub fn row_mut(&mut self) -> Option<&mut TableRow> {
        match self {
            TableAction::Add(row)
            | TableAction::UpdateReplace { row, .. }
            | TableAction::UpsertReplace(row) => Some(row),
            TableAction::Delete { .. } => None,
        }
    }
}

/// Row filter. Row key bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableQuery {
    pub partition_key: Option<String>,
    pub row_key_range: Option<(String, String)>,

    /// Property names to return. Keys, etag and timestamp are always returned.
    pub select: Option<Vec<String>>,
}

impl TableQuery {
    /// Every row of the table.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every row of one partition.
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: Some(partition_key.into()),
            ..Self::default()
        }
    }

    pub fn with_row_key_range(mut self, min: impl Into<String>, max: impl Into<String>) -> Self {
        self.row_key_range = Some((min.into(), max.into()));
        self
    }

    pub fn with_select<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, partition_key: &str, row_key: &str) -> bool {
        if let Some(pk) = &self.partition_key {
            if pk != partition_key {
                return false;
            }
        }
        if let Some((min, max)) = &self.row_key_range {
            if row_key < min.as_str() || row_key > max.as_str() {
                return false;
            }
        }
        true
    }
}

/// Position to resume a query from (inclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    pub next_partition_key: String,
    pub next_row_key: String,
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub rows: Vec<TableRow>,
    pub continuation: Option<ContinuationToken>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_matches_range_inclusive() {
        let query = TableQuery::partition("p").with_row_key_range("b~", "b~00");
        assert!(query.matches("p", "b~"));
        assert!(query.matches("p", "b~00"));
        assert!(!query.matches("p", "b~01"));
        assert!(!query.matches("q", "b~00"));
        assert!(!query.matches("p", "a~00"));
    }

    #[test]
    fn test_action_keys() {
        let add = TableAction::Add(TableRow::new("p", "r"));
        assert_eq!(add.partition_key(), "p");
        assert_eq!(add.row_key(), "r");
        assert!(add.row().is_some());

        let delete = TableAction::Delete {
            partition_key: "p".into(),
            row_key: "s".into(),
            if_match: IfMatch::Any,
        };
        assert_eq!(delete.row_key(), "s");
        assert!(delete.row().is_none());
    }
}
