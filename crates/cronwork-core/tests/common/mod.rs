// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test utilities for cronwork-core integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};
use cronwork_core::budget::TimeBudget;
use cronwork_core::runtime::JobContext;
use cronwork_store::{InsertOptions, MemoryStore, Predicate, Row, SelectOptions, Store};
use serde_json::{Value, json};

/// Fixed run start used by archive tests: 2025-01-01T00:00:00Z.
pub fn start_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_735_689_600, 0)
        .single()
        .expect("valid timestamp")
}

/// Context with a generous budget.
pub fn context() -> JobContext {
    JobContext::new(TimeBudget::new(Duration::from_secs(60)))
}

/// Build a row from column/value pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), value.clone()))
        .collect()
}

/// Session rows `1..=count`, all expired relative to [`start_time`].
pub fn expired_sessions(count: i64) -> Vec<Row> {
    let base = start_time().timestamp() - 86_400;
    (1..=count)
        .map(|id| {
            row(&[
                ("id", json!(id)),
                ("expires_at", json!(base + id)),
                ("payload", json!(format!("session-{}", id))),
            ])
        })
        .collect()
}

/// Memory store with `table` keyed by `id` and seeded with `rows`.
pub async fn seeded_store(table: &str, rows: &[Row]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.create_table(table, &["id"]).await;
    if !rows.is_empty() {
        store
            .insert(table, rows, &InsertOptions::default())
            .await
            .expect("seed rows");
    }
    store
}

/// Ids present in `table`, with duplicates preserved.
pub async fn ids(store: &dyn Store, table: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = store
        .select(table, &Predicate::All, &SelectOptions::default())
        .await
        .expect("select ids")
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64))
        .collect();
    ids.sort_unstable();
    ids
}

/// Distinct ids present in either store.
pub async fn union_ids(primary: &dyn Store, secondary: &dyn Store, table: &str) -> BTreeSet<i64> {
    let mut all: BTreeSet<i64> = ids(primary, table).await.into_iter().collect();
    all.extend(ids(secondary, table).await);
    all
}

/// One JSON log line the way producers write them.
pub fn log_line(channel: &str, level: i64, created: f64, message: &str) -> String {
    json!({
        "channel": channel,
        "level": level,
        "created": created,
        "node": "web-1",
        "message": message,
        "context": {},
    })
    .to_string()
}

/// Write `lines` to `dir/name` and backdate its mtime by `age`.
pub fn write_log_file(dir: &Path, name: &str, lines: &[String], age: Duration) -> PathBuf {
    let path = dir.join(name);
    let mut contents = lines.join("\n");
    contents.push('\n');
    std::fs::write(&path, contents).expect("write log file");
    set_age(&path, age);
    path
}

/// Backdate the mtime of `path` by `age`.
pub fn set_age(path: &Path, age: Duration) {
    let file = File::options()
        .write(true)
        .open(path)
        .expect("open log file");
    file.set_modified(SystemTime::now() - age)
        .expect("set mtime");
}
