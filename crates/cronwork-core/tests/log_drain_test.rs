// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the log drain.
//!
//! These tests write real rotated files into a temp directory and drain them
//! into an in-memory log store. Read faults and disappearing files are
//! injected through a wrapping file system.

mod common;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use cronwork_core::error::{ErrorCause, INGEST_FAILURE_MESSAGE};
use cronwork_core::logs::{
    Candidate, DrainPass, FileRead, LocalFileSystem, LogDrain, LogDrainConfig, LogDrainJob,
    LogFileSystem, LogIngestor,
};
use cronwork_core::mutex::{AdvisoryLock, FileMutex, LockFileMutex, MemoryMutex};
use cronwork_core::runtime::JobRuntime;
use cronwork_store::{MemoryStore, Operation, Predicate, SelectOptions, SqliteStore, Store};
use serde_json::{Value, json};
use tempfile::TempDir;

const OLD: Duration = Duration::from_secs(600);

fn drain_config(dir: &Path) -> LogDrainConfig {
    LogDrainConfig {
        folder: dir.to_path_buf(),
        log_file_interval_secs: 0,
        safety_margin_secs: 60,
        lock_timeout_ms: 20,
        idle_wait_ms: 0,
        node: Some("drain-test".to_string()),
        ..LogDrainConfig::default()
    }
}

async fn log_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.create_table("logs", &[]).await;
    store
}

fn build_drain(
    config: LogDrainConfig,
    lock: Arc<dyn AdvisoryLock>,
    store: Arc<MemoryStore>,
) -> LogDrain {
    let mutex = FileMutex::new(lock, config.lock_timeout());
    let ingestor = LogIngestor::new(store, config.log_table.clone(), config.chunk_size);
    LogDrain::new(config, mutex, ingestor)
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn three_lines() -> Vec<String> {
    vec![
        log_line("billing", 400, 1_700_000_000.0, "charge declined"),
        log_line("billing", 200, 1_700_000_001.0, "charge accepted"),
        log_line("auth", 300, 1_700_000_002.0, "password reset"),
    ]
}

/// Local file system with scripted read faults and vanishing files.
#[derive(Default)]
struct ScriptedFs {
    inner: LocalFileSystem,
    read_faults: Mutex<BTreeSet<PathBuf>>,
    vanished: Mutex<BTreeSet<PathBuf>>,
    locked: Mutex<BTreeSet<PathBuf>>,
}

impl ScriptedFs {
    fn fail_read(&self, path: &Path) {
        self.read_faults.lock().unwrap().insert(path.to_path_buf());
    }

    fn vanish(&self, path: &Path) {
        self.vanished.lock().unwrap().insert(path.to_path_buf());
    }

    fn lock_for_writing(&self, path: &Path) {
        self.locked.lock().unwrap().insert(path.to_path_buf());
    }
}

#[async_trait]
impl LogFileSystem for ScriptedFs {
    fn list_matching(
        &self,
        folder: &Path,
        pattern: &str,
    ) -> cronwork_core::Result<Vec<Candidate>> {
        self.inner.list_matching(folder, pattern)
    }

    async fn read_with_lock(&self, path: &Path) -> std::io::Result<FileRead> {
        if self.read_faults.lock().unwrap().contains(path) {
            return Err(std::io::Error::other("injected read fault"));
        }
        if self.vanished.lock().unwrap().contains(path) {
            return Ok(FileRead::Vanished);
        }
        if self.locked.lock().unwrap().contains(path) {
            return Ok(FileRead::Locked);
        }
        self.inner.read_with_lock(path).await
    }

    async fn delete(&self, path: &Path) -> std::io::Result<bool> {
        self.inner.delete(path).await
    }
}

// ============================================================================
// Draining
// ============================================================================

#[tokio::test]
async fn test_drains_file_and_deletes_it() {
    let dir = TempDir::new().unwrap();
    let mut lines = three_lines();
    lines.push(log_line(
        "cronwork",
        400,
        1_700_000_003.0,
        &format!("{}: connection refused", INGEST_FAILURE_MESSAGE),
    ));
    lines.push("not json".to_string());
    let path = write_log_file(dir.path(), "app.log.1", &lines, OLD);

    let store = log_store().await;
    let lock = Arc::new(MemoryMutex::new());
    let drain = build_drain(drain_config(dir.path()), lock.clone(), store.clone());
    let mut ctx = context();

    let pass = drain.pass(&mut ctx).await.unwrap();

    let DrainPass::Processed { path: drained, summary } = pass else {
        panic!("expected a processed file, got {:?}", pass);
    };
    assert_eq!(drained, path);
    assert_eq!(summary.rows, 3);
    assert_eq!(summary.filtered, 1);
    assert_eq!(summary.skipped, 1);
    assert!(summary.deleted);
    assert!(!path.exists());
    assert!(ctx.errors.is_empty());

    let rows = store.rows("logs").await;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["Channel"], json!("billing"));
    assert_eq!(rows[0]["Log_Level"], json!(400));
    assert_eq!(rows[0]["Node"], json!("web-1"));
    let message: Value = serde_json::from_str(rows[0]["Message"].as_str().unwrap()).unwrap();
    assert_eq!(message["message"], json!("charge declined"));

    assert_eq!(lock.acquire_count(&key(&path)), 1);
    assert_eq!(lock.release_count(&key(&path)), 1);
    assert!(!lock.is_held(&key(&path)));
}

#[tokio::test]
async fn test_one_file_per_pass_oldest_first() {
    let dir = TempDir::new().unwrap();
    let newer = write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    let older = write_log_file(dir.path(), "app.log.2", &three_lines(), OLD * 2);

    let store = log_store().await;
    let drain = build_drain(
        drain_config(dir.path()),
        Arc::new(MemoryMutex::new()),
        store.clone(),
    );
    let mut ctx = context();

    let first = drain.pass(&mut ctx).await.unwrap();
    assert!(matches!(&first, DrainPass::Processed { path, .. } if *path == older));
    assert!(newer.exists());
    assert_eq!(store.rows("logs").await.len(), 3);

    let second = drain.pass(&mut ctx).await.unwrap();
    assert!(matches!(&second, DrainPass::Processed { path, .. } if *path == newer));
    assert_eq!(store.rows("logs").await.len(), 6);
}

#[tokio::test]
async fn test_young_files_are_left_alone() {
    let dir = TempDir::new().unwrap();
    let path = write_log_file(dir.path(), "app.log.1", &three_lines(), Duration::from_secs(5));

    let store = log_store().await;
    let lock = Arc::new(MemoryMutex::new());
    let drain = build_drain(drain_config(dir.path()), lock.clone(), store.clone());
    let mut ctx = context();

    let pass = drain.pass(&mut ctx).await.unwrap();

    assert_eq!(pass, DrainPass::Idle { candidates: 1 });
    assert!(path.exists());
    assert_eq!(lock.acquire_count(&key(&path)), 0);
    assert!(store.rows("logs").await.is_empty());
}

#[tokio::test]
async fn test_later_files_need_more_age() {
    let dir = TempDir::new().unwrap();
    let oldest = write_log_file(dir.path(), "app.log.2", &three_lines(), Duration::from_secs(500));
    let second = write_log_file(dir.path(), "app.log.1", &three_lines(), Duration::from_secs(150));

    let config = LogDrainConfig {
        log_file_interval_secs: 200,
        safety_margin_secs: 10,
        ..drain_config(dir.path())
    };
    let lock = Arc::new(MemoryMutex::new());
    let drain = build_drain(config, lock.clone(), log_store().await);
    assert_eq!(drain.min_age(0), Duration::from_secs(10));
    assert_eq!(drain.min_age(1), Duration::from_secs(210));
    let mut ctx = context();

    // With the oldest claimed elsewhere, the second one is too young for index 1
    lock.hold(&key(&oldest));
    let blocked = drain.pass(&mut ctx).await.unwrap();
    assert_eq!(blocked, DrainPass::Idle { candidates: 2 });
    assert_eq!(lock.acquire_count(&key(&second)), 0);

    lock.release(&key(&oldest)).unwrap();
    let first = drain.pass(&mut ctx).await.unwrap();
    assert!(matches!(&first, DrainPass::Processed { path, .. } if *path == oldest));

    // Now the only file, at index 0
    let next = drain.pass(&mut ctx).await.unwrap();
    assert!(matches!(&next, DrainPass::Processed { path, .. } if *path == second));
}

#[tokio::test]
async fn test_second_scan_finds_nothing() {
    let dir = TempDir::new().unwrap();
    write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    write_log_file(dir.path(), "app.log.2", &three_lines(), OLD);
    let store = log_store().await;
    let lock: Arc<dyn AdvisoryLock> = Arc::new(MemoryMutex::new());

    let config = drain_config(dir.path());
    let mut job = LogDrainJob::new(build_drain(config.clone(), lock.clone(), store.clone()), true);
    let first = JobRuntime::new().execute(&mut job, context()).await;

    assert!(!first.has_errors());
    assert_eq!(first.result["log-drain"].as_object().unwrap().len(), 2);
    assert_eq!(store.rows("logs").await.len(), 6);

    let mut job = LogDrainJob::new(build_drain(config, lock, store.clone()), true);
    let second = JobRuntime::new().execute(&mut job, context()).await;

    assert!(!second.has_errors());
    assert_eq!(second.result["log-drain"], json!({}));
    assert_eq!(store.rows("logs").await.len(), 6);
}

// ============================================================================
// Faults and contention
// ============================================================================

#[tokio::test]
async fn test_ingest_failure_keeps_file_and_releases_lock() {
    let dir = TempDir::new().unwrap();
    let path = write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    let store = log_store().await;
    store.fail_next(Operation::Insert, "logs", 1).await;
    let lock = Arc::new(MemoryMutex::new());
    let drain = build_drain(drain_config(dir.path()), lock.clone(), store.clone());
    let mut ctx = context();

    let pass = drain.pass(&mut ctx).await.unwrap();

    assert_eq!(pass, DrainPass::Idle { candidates: 1 });
    assert!(path.exists());
    let detail = ctx
        .errors
        .get(ErrorCause::LogIngestFailed, &key(&path))
        .unwrap();
    assert!(detail.starts_with(INGEST_FAILURE_MESSAGE));
    assert_eq!(lock.acquire_count(&key(&path)), 1);
    assert_eq!(lock.release_count(&key(&path)), 1);

    // The next run picks the file up again
    let retry = drain.pass(&mut ctx).await.unwrap();
    assert!(matches!(retry, DrainPass::Processed { .. }));
    assert!(!path.exists());
    assert_eq!(lock.release_count(&key(&path)), 2);
}

#[tokio::test]
async fn test_read_fault_is_recorded_and_lock_released() {
    let dir = TempDir::new().unwrap();
    let path = write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    let fs = Arc::new(ScriptedFs::default());
    fs.fail_read(&path);
    let lock = Arc::new(MemoryMutex::new());
    let drain = build_drain(drain_config(dir.path()), lock.clone(), log_store().await)
        .with_file_system(fs);
    let mut ctx = context();

    let pass = drain.pass(&mut ctx).await.unwrap();

    assert_eq!(pass, DrainPass::Idle { candidates: 1 });
    assert!(path.exists());
    assert!(
        ctx.errors
            .get(ErrorCause::LogReadFailed, &key(&path))
            .unwrap()
            .contains("injected read fault")
    );
    assert_eq!(lock.release_count(&key(&path)), 1);
}

#[tokio::test]
async fn test_vanished_file_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let path = write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    let fs = Arc::new(ScriptedFs::default());
    fs.vanish(&path);
    let lock = Arc::new(MemoryMutex::new());
    let store = log_store().await;
    let drain = build_drain(drain_config(dir.path()), lock.clone(), store.clone())
        .with_file_system(fs);
    let mut ctx = context();

    let pass = drain.pass(&mut ctx).await.unwrap();

    assert_eq!(pass, DrainPass::Idle { candidates: 1 });
    assert!(ctx.errors.is_empty());
    assert!(store.rows("logs").await.is_empty());
    assert_eq!(lock.acquire_count(&key(&path)), 1);
    assert_eq!(lock.release_count(&key(&path)), 1);
}

#[tokio::test]
async fn test_producer_write_lock_skips_file() {
    let dir = TempDir::new().unwrap();
    let busy = write_log_file(dir.path(), "app.log.2", &three_lines(), OLD * 2);
    let free = write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    let fs = Arc::new(ScriptedFs::default());
    fs.lock_for_writing(&busy);
    let lock = Arc::new(MemoryMutex::new());
    let drain = build_drain(drain_config(dir.path()), lock.clone(), log_store().await)
        .with_file_system(fs);
    let mut ctx = context();

    let pass = drain.pass(&mut ctx).await.unwrap();

    assert!(matches!(&pass, DrainPass::Processed { path, .. } if *path == free));
    assert!(busy.exists());
    assert!(ctx.errors.is_empty());
    assert_eq!(lock.release_count(&key(&busy)), 1);
}

#[tokio::test]
async fn test_claimed_file_is_skipped() {
    let dir = TempDir::new().unwrap();
    let path = write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    let lock = Arc::new(MemoryMutex::new());
    lock.hold(&key(&path));
    let store = log_store().await;
    let drain = build_drain(drain_config(dir.path()), lock.clone(), store.clone());
    let mut ctx = context();

    let pass = drain.pass(&mut ctx).await.unwrap();

    assert_eq!(pass, DrainPass::Idle { candidates: 1 });
    assert!(path.exists());
    assert!(ctx.errors.is_empty());
    assert!(store.rows("logs").await.is_empty());
    assert_eq!(lock.release_count(&key(&path)), 0);
}

#[tokio::test]
async fn test_dry_run_reads_but_keeps_file() {
    let dir = TempDir::new().unwrap();
    let path = write_log_file(dir.path(), "app.log.1", &three_lines(), OLD);
    let store = log_store().await;
    let drain = build_drain(
        drain_config(dir.path()),
        Arc::new(MemoryMutex::new()),
        store.clone(),
    );
    let mut ctx = context().with_dry_run(true);

    let pass = drain.pass(&mut ctx).await.unwrap();

    let DrainPass::Processed { summary, .. } = pass else {
        panic!("expected a processed file");
    };
    assert_eq!(summary.rows, 3);
    assert!(!summary.deleted);
    assert!(path.exists());
    assert!(store.rows("logs").await.is_empty());
}

// ============================================================================
// Real locks and a real database
// ============================================================================

#[tokio::test]
async fn test_drains_into_sqlite_with_lock_files() {
    let dir = TempDir::new().unwrap();
    let logs_dir = dir.path().join("logs");
    let lock_dir = dir.path().join("locks");
    std::fs::create_dir_all(&logs_dir).unwrap();
    let path = write_log_file(&logs_dir, "app.log.1", &three_lines(), OLD);

    let sqlite = Arc::new(SqliteStore::from_path(dir.path().join("logs.db")).await.unwrap());
    let lock = Arc::new(LockFileMutex::new(&lock_dir));

    let config = drain_config(&logs_dir);
    let mutex = FileMutex::new(lock.clone(), config.lock_timeout());
    let ingestor = LogIngestor::new(sqlite.clone(), "logs", 2);
    let mut job = LogDrainJob::new(LogDrain::new(config, mutex, ingestor), true);

    let report = JobRuntime::new().execute(&mut job, context()).await;

    assert!(!report.has_errors(), "errors: {:?}", report.errors);
    assert!(!path.exists());
    let rows = sqlite
        .select(
            "logs",
            &Predicate::eq("Channel", "billing"),
            &SelectOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(!lock.lock_path(&key(&path)).exists());
}
