// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store trait definitions.
//!
//! Defines the narrow relational interface the job runtime consumes. A
//! single `select`, `insert` or `delete` call is assumed to be atomic; no
//! transaction ever spans more than one call.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::predicate::Predicate;

/// One table row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// Sort direction for [`SelectOptions::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first (default).
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// Projection, paging and ordering for a select.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Columns to return; `None` returns every column.
    pub columns: Option<Vec<String>>,
    /// Maximum number of rows.
    pub limit: Option<u64>,
    /// Rows to skip before the first returned row.
    pub offset: u64,
    /// Sort keys, applied in order.
    pub order_by: Vec<(String, SortOrder)>,
}

impl SelectOptions {
    /// Restrict the projection.
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Cap the number of rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip rows.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Append a sort key.
    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((column.into(), order));
        self
    }
}

/// What an insert does when a row collides with an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDuplicate {
    /// Fail the statement (default).
    #[default]
    Fail,
    /// Keep the existing row.
    Ignore,
    /// Overwrite the existing row (upsert).
    Replace,
}

/// Options for [`Store::insert`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    /// Duplicate-key behavior.
    pub on_duplicate: OnDuplicate,
}

impl InsertOptions {
    /// Upsert semantics: colliding rows are overwritten.
    pub fn upsert() -> Self {
        Self {
            on_duplicate: OnDuplicate::Replace,
        }
    }
}

/// Relational store consumed by the jobs.
///
/// Implementations must be usable from a single cooperative task; they are
/// `Send + Sync` so they can be shared behind an `Arc`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend identifier (e.g., "sqlite", "memory").
    fn backend(&self) -> &'static str;

    /// Return rows of `table` matching `predicate`.
    async fn select(
        &self,
        table: &str,
        predicate: &Predicate,
        options: &SelectOptions,
    ) -> Result<Vec<Row>>;

    /// Insert `rows` into `table`, returning the number of rows written.
    ///
    /// Columns are the union of the rows' keys; a row missing a column
    /// writes `NULL` for it.
    async fn insert(&self, table: &str, rows: &[Row], options: &InsertOptions) -> Result<u64>;

    /// Delete rows of `table` matching `predicate`, returning how many went.
    async fn delete(&self, table: &str, predicate: &Predicate) -> Result<u64>;
}

/// Column set of a batch of rows, in stable order.
pub fn column_union(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns.sort();
    columns
}
