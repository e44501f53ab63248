// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for testing.
//!
//! A simple store implementation that keeps tables as row vectors and can be
//! scripted to fail specific operations on specific tables. The archive/clean
//! protocol tests use it to force every interleaving of archive, clean and
//! compensation failures.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::predicate::{Predicate, compare_values};
use crate::traits::{InsertOptions, OnDuplicate, Row, SelectOptions, SortOrder, Store};

/// Store operation, used to target scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    /// [`Store::select`]
    Select,
    /// [`Store::insert`]
    Insert,
    /// [`Store::delete`]
    Delete,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    key_columns: Vec<String>,
    rows: Vec<Row>,
}

impl MemoryTable {
    fn position_of(&self, row: &Row) -> Option<usize> {
        if self.key_columns.is_empty() {
            return None;
        }
        self.rows.iter().position(|existing| {
            self.key_columns.iter().all(|column| {
                match (existing.get(column), row.get(column)) {
                    (Some(a), Some(b)) => compare_values(a, b) == Some(Ordering::Equal),
                    _ => false,
                }
            })
        })
    }
}

/// In-memory store for testing.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, MemoryTable>>,
    /// Remaining scripted failures per (operation, table).
    failures: Mutex<BTreeMap<(Operation, String), u32>>,
    /// Number of calls seen per (operation, table), including failed ones.
    calls: Mutex<BTreeMap<(Operation, String), u32>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) a table with the given unique key columns.
    ///
    /// Key columns drive duplicate detection for inserts; a table without
    /// key columns accepts every row.
    pub async fn create_table(&self, table: &str, key_columns: &[&str]) {
        let mut tables = self.tables.lock().await;
        tables.insert(
            table.to_string(),
            MemoryTable {
                key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Snapshot of a table's rows in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let tables = self.tables.lock().await;
        tables.get(table).map(|t| t.rows.clone()).unwrap_or_default()
    }

    /// Make the next `times` calls of `operation` on `table` fail.
    pub async fn fail_next(&self, operation: Operation, table: &str, times: u32) {
        let mut failures = self.failures.lock().await;
        *failures
            .entry((operation, table.to_string()))
            .or_insert(0) += times;
    }

    /// Make every call of `operation` on `table` fail until cleared.
    pub async fn fail_always(&self, operation: Operation, table: &str) {
        let mut failures = self.failures.lock().await;
        failures.insert((operation, table.to_string()), u32::MAX);
    }

    /// Remove every scripted failure.
    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    /// How many times `operation` was called on `table`.
    pub async fn call_count(&self, operation: Operation, table: &str) -> u32 {
        let calls = self.calls.lock().await;
        calls
            .get(&(operation, table.to_string()))
            .copied()
            .unwrap_or(0)
    }

    async fn check(&self, operation: Operation, table: &str) -> Result<()> {
        {
            let mut calls = self.calls.lock().await;
            *calls.entry((operation, table.to_string())).or_insert(0) += 1;
        }

        let mut failures = self.failures.lock().await;
        if let Some(remaining) = failures.get_mut(&(operation, table.to_string()))
            && *remaining > 0
        {
            if *remaining != u32::MAX {
                *remaining -= 1;
            }
            return Err(StoreError::Unavailable {
                operation: operation.as_str(),
                table: table.to_string(),
            });
        }
        Ok(())
    }
}

fn order_rows(rows: &mut [Row], order_by: &[(String, SortOrder)]) {
    rows.sort_by(|a, b| {
        for (column, order) in order_by {
            let left = a.get(column).unwrap_or(&Value::Null);
            let right = b.get(column).unwrap_or(&Value::Null);
            // NULL sorts first, as in SQLite
            let ordering = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
            };
            let ordering = match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn select(
        &self,
        table: &str,
        predicate: &Predicate,
        options: &SelectOptions,
    ) -> Result<Vec<Row>> {
        self.check(Operation::Select, table).await?;

        let tables = self.tables.lock().await;
        let data = tables.get(table).ok_or_else(|| StoreError::UnknownTable {
            table: table.to_string(),
        })?;

        let mut rows: Vec<Row> = data
            .rows
            .iter()
            .filter(|row| predicate.matches(row))
            .cloned()
            .collect();
        order_rows(&mut rows, &options.order_by);

        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let rows = rows
            .into_iter()
            .skip(options.offset as usize)
            .take(limit)
            .map(|row| match &options.columns {
                Some(columns) => row
                    .into_iter()
                    .filter(|(k, _)| columns.contains(k))
                    .collect(),
                None => row,
            })
            .collect();

        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: &[Row], options: &InsertOptions) -> Result<u64> {
        self.check(Operation::Insert, table).await?;

        let mut tables = self.tables.lock().await;
        let data = tables.get_mut(table).ok_or_else(|| StoreError::UnknownTable {
            table: table.to_string(),
        })?;

        // Apply to a copy so a failing statement leaves the table untouched
        let mut staged = data.clone();
        let mut written = 0u64;
        for row in rows {
            match staged.position_of(row) {
                Some(index) => match options.on_duplicate {
                    OnDuplicate::Fail => {
                        return Err(StoreError::Query {
                            operation: "insert",
                            table: table.to_string(),
                            details: "UNIQUE constraint failed".to_string(),
                        });
                    }
                    OnDuplicate::Ignore => {}
                    OnDuplicate::Replace => {
                        staged.rows[index] = row.clone();
                        written += 1;
                    }
                },
                None => {
                    staged.rows.push(row.clone());
                    written += 1;
                }
            }
        }
        *data = staged;

        Ok(written)
    }

    async fn delete(&self, table: &str, predicate: &Predicate) -> Result<u64> {
        self.check(Operation::Delete, table).await?;

        let mut tables = self.tables.lock().await;
        let data = tables.get_mut(table).ok_or_else(|| StoreError::UnknownTable {
            table: table.to_string(),
        })?;

        let before = data.rows.len();
        data.rows.retain(|row| !predicate.matches(row));
        Ok((before - data.rows.len()) as u64)
    }
}
