// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for cronwork-store.
//!
//! The embedded schema only covers tables cronwork owns: the log store, the
//! notification rules and their members, and the work queue. Tables that
//! are archived and cleaned belong to the host application and are never
//! created here.
//!
//! # Example
//!
//! ```ignore
//! use cronwork_store::migrations;
//!
//! let pool = sqlx::SqlitePool::connect(&database_url).await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use crate::error::Result;

/// SQLite migrator with all cronwork migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<()> {
    SQLITE.run(pool).await?;
    Ok(())
}
