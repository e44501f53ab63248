// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The SQLite and in-memory backends must agree.
//!
//! Job tests run against [`MemoryStore`]; these tests replay the same
//! operations against a file-backed SQLite database and compare results.

mod common;

use common::*;
use cronwork_store::{
    InsertOptions, MemoryStore, OnDuplicate, Predicate, Row, SelectOptions, SortOrder,
    SqliteStore, Store, StoreError, migrations,
};
use serde_json::json;
use tempfile::TempDir;

async fn both() -> (TempDir, SqliteStore, MemoryStore) {
    let dir = TempDir::new().unwrap();
    let sqlite = sqlite_store(&dir).await;
    let memory = memory_store().await;
    for store in [&sqlite as &dyn Store, &memory] {
        let written = store
            .insert(LINE_ITEMS, &sample_items(), &InsertOptions::default())
            .await
            .unwrap();
        assert_eq!(written, 6, "{}", store.backend());
    }
    (dir, sqlite, memory)
}

fn by_key() -> SelectOptions {
    SelectOptions::default()
        .order_by("order_id", SortOrder::Asc)
        .order_by("line", SortOrder::Asc)
}

#[tokio::test]
async fn test_select_filters_orders_and_pages_alike() {
    let (_dir, sqlite, memory) = both().await;
    let predicate = Predicate::ge("qty", 2);
    let options = by_key().limit(2).offset(1);

    let from_sqlite = sqlite.select(LINE_ITEMS, &predicate, &options).await.unwrap();
    let from_memory = memory.select(LINE_ITEMS, &predicate, &options).await.unwrap();

    assert_eq!(keys(&from_sqlite), vec![(2, 1), (2, 2)]);
    assert_eq!(from_sqlite, from_memory);
}

#[tokio::test]
async fn test_projection_and_descending_order_alike() {
    let (_dir, sqlite, memory) = both().await;
    let options = SelectOptions::default()
        .columns(vec!["sku".to_string(), "qty".to_string()])
        .order_by("qty", SortOrder::Desc)
        .order_by("sku", SortOrder::Asc)
        .limit(3);

    let from_sqlite = sqlite.select(LINE_ITEMS, &Predicate::All, &options).await.unwrap();
    let from_memory = memory.select(LINE_ITEMS, &Predicate::All, &options).await.unwrap();

    let skus: Vec<_> = from_sqlite.iter().map(|r| r["sku"].clone()).collect();
    assert_eq!(skus, vec![json!("apple"), json!("fig"), json!("apple")]);
    assert!(from_sqlite.iter().all(|r| r.len() == 2));
    assert_eq!(from_sqlite, from_memory);
}

#[tokio::test]
async fn test_composite_key_delete_never_crosses_keys() {
    let (_dir, sqlite, memory) = both().await;
    // (1, 1) and (2, 2) must not take (1, 2) or (2, 1) with them
    let doomed = vec![line_item(1, 1, "apple", 3), line_item(2, 2, "plum", 2)];
    let key_columns = vec!["order_id".to_string(), "line".to_string()];
    let predicate = Predicate::for_keys(&key_columns, &doomed);

    for store in [&sqlite as &dyn Store, &memory] {
        let deleted = store.delete(LINE_ITEMS, &predicate).await.unwrap();
        assert_eq!(deleted, 2, "{}", store.backend());

        let remaining = store
            .select(LINE_ITEMS, &Predicate::All, &by_key())
            .await
            .unwrap();
        assert_eq!(
            keys(&remaining),
            vec![(1, 2), (2, 1), (3, 1), (3, 2)],
            "{}",
            store.backend()
        );
    }
}

#[tokio::test]
async fn test_duplicate_handling_alike() {
    let (_dir, sqlite, memory) = both().await;
    let changed = vec![line_item(1, 1, "apple", 30), line_item(4, 1, "lime", 1)];

    for store in [&sqlite as &dyn Store, &memory] {
        let name = store.backend();

        let err = store
            .insert(LINE_ITEMS, &changed, &InsertOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }), "{}: {:?}", name, err);

        let ignored = store
            .insert(
                LINE_ITEMS,
                &changed[..1],
                &InsertOptions {
                    on_duplicate: OnDuplicate::Ignore,
                },
            )
            .await
            .unwrap();
        assert_eq!(ignored, 0, "{}", name);

        let upserted = store
            .insert(LINE_ITEMS, &changed, &InsertOptions::upsert())
            .await
            .unwrap();
        assert_eq!(upserted, 2, "{}", name);

        let first = store
            .select(
                LINE_ITEMS,
                &Predicate::And(vec![Predicate::eq("order_id", 1), Predicate::eq("line", 1)]),
                &SelectOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(first[0]["qty"], json!(30), "{}", name);
        let total = store
            .select(LINE_ITEMS, &Predicate::All, &SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(total.len(), 7, "{}", name);
    }
}

#[tokio::test]
async fn test_empty_in_list_matches_nothing() {
    let (_dir, sqlite, memory) = both().await;
    let predicate = Predicate::is_in("sku", Vec::new());

    for store in [&sqlite as &dyn Store, &memory] {
        assert!(
            store
                .select(LINE_ITEMS, &predicate, &SelectOptions::default())
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.delete(LINE_ITEMS, &predicate).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_missing_table_is_an_error() {
    let (_dir, sqlite, memory) = both().await;

    for store in [&sqlite as &dyn Store, &memory] {
        let result = store
            .select("no_such_table", &Predicate::All, &SelectOptions::default())
            .await;
        assert!(result.is_err(), "{}", store.backend());
    }
}

#[tokio::test]
async fn test_reopening_database_reruns_migrations_safely() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("logs.db");
    let first = SqliteStore::from_path(&path).await.unwrap();
    migrations::run_sqlite(first.pool()).await.unwrap();
    let mut message = Row::new();
    message.insert("payload".to_string(), json!("hello"));
    message.insert("created_at".to_string(), json!(1.0));
    first
        .insert("job_queue", &[message], &InsertOptions::default())
        .await
        .unwrap();
    drop(first);

    let second = SqliteStore::from_path(&path).await.unwrap();
    let rows = second
        .select("job_queue", &Predicate::All, &SelectOptions::default())
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["topic"], json!("default"));
    assert_eq!(rows[0]["id"], json!(1));
}
