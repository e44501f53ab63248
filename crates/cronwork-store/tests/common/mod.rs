// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test utilities for cronwork-store integration tests.

#![allow(dead_code)]

use cronwork_store::{MemoryStore, Row, SqliteStore};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Order lines keyed by `(order_id, line)`.
pub const LINE_ITEMS: &str = "line_items";

/// A line item row.
pub fn line_item(order_id: i64, line: i64, sku: &str, qty: i64) -> Row {
    let mut row = Row::new();
    row.insert("order_id".to_string(), json!(order_id));
    row.insert("line".to_string(), json!(line));
    row.insert("sku".to_string(), json!(sku));
    row.insert("qty".to_string(), json!(qty));
    row
}

/// Six line items across three orders.
pub fn sample_items() -> Vec<Row> {
    vec![
        line_item(1, 1, "apple", 3),
        line_item(1, 2, "pear", 1),
        line_item(2, 1, "apple", 5),
        line_item(2, 2, "plum", 2),
        line_item(3, 1, "fig", 4),
        line_item(3, 2, "kiwi", 1),
    ]
}

/// `(order_id, line)` of each row.
pub fn keys(rows: &[Row]) -> Vec<(i64, i64)> {
    rows.iter()
        .map(|r| {
            (
                r.get("order_id").and_then(Value::as_i64).unwrap_or(-1),
                r.get("line").and_then(Value::as_i64).unwrap_or(-1),
            )
        })
        .collect()
}

/// File-backed SQLite store with the line item table created.
pub async fn sqlite_store(dir: &TempDir) -> SqliteStore {
    let store = SqliteStore::from_path(dir.path().join("store.db"))
        .await
        .expect("open sqlite store");
    sqlx::query(
        r#"
        CREATE TABLE line_items (
            order_id INTEGER NOT NULL,
            line INTEGER NOT NULL,
            sku TEXT NOT NULL,
            qty INTEGER NOT NULL,
            PRIMARY KEY (order_id, line)
        )
        "#,
    )
    .execute(store.pool())
    .await
    .expect("create line_items");
    store
}

/// Memory store with the same table and key.
pub async fn memory_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_table(LINE_ITEMS, &["order_id", "line"]).await;
    store
}
