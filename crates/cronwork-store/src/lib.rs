// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cronwork Store - Relational Store Collaborator
//!
//! This crate provides the narrow relational interface consumed by the
//! cronwork job runtime: predicate-based `select`, `insert` and `delete`
//! against named tables whose schema the runtime does not know in advance.
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `select` | Rows matching a [`Predicate`], with projection, order, limit and offset |
//! | `insert` | Bulk insert with `Fail`, `Ignore` or `Replace` (upsert) on duplicate keys |
//! | `delete` | Rows matching a [`Predicate`], returns the count removed |
//!
//! Every call is a single statement and is assumed atomic. Nothing in this
//! crate opens a transaction spanning more than one call; callers that need
//! multi-step consistency (the archive/clean protocol) compensate instead.
//!
//! # Backends
//!
//! | Backend | Type | Use |
//! |---------|------|-----|
//! | SQLite | [`SqliteStore`] | Production stores, embedded migrations for owned tables |
//! | Memory | [`MemoryStore`] | Tests; scripted per-operation failures |
//!
//! # Modules
//!
//! - [`error`]: Store error type with error codes
//! - [`predicate`]: Row predicates and SQL-style value ordering
//! - [`traits`]: The [`Store`] trait, rows and select/insert options
//! - [`sqlite`]: SQLite backend
//! - [`memory`]: In-memory backend
//! - [`migrations`]: Embedded schema for cronwork-owned tables

#![deny(missing_docs)]

/// Error types for store operations.
pub mod error;

/// In-memory store with scripted failures.
pub mod memory;

/// Embedded migrations for cronwork-owned tables.
pub mod migrations;

/// Row predicates.
pub mod predicate;

/// SQLite-backed store.
pub mod sqlite;

/// Store trait and option types.
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::{MemoryStore, Operation};
pub use predicate::{CmpOp, Predicate};
pub use sqlite::SqliteStore;
pub use traits::{InsertOptions, OnDuplicate, Row, SelectOptions, SortOrder, Store};
