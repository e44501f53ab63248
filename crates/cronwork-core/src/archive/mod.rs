// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive-then-clean of expiring rows.
//!
//! Each configured table moves in batches: select rows whose expiry column
//! is below the run's start time, copy them to the secondary store with
//! upsert semantics, then delete them from the primary store. A failed step
//! is retried on a later pass until the table's retry ceiling is exceeded.
//!
//! - [`state`]: [`TableJobState`], [`BatchLag`] and [`PassOutcome`]
//! - [`machine`]: the store-facing protocol for one table
//! - [`driver`]: one pass over every table and the exit verdict
//! - [`job`]: the `archive-clean` [`Job`](crate::runtime::Job)

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};

pub mod driver;
pub mod job;
pub mod machine;
pub mod state;

pub use driver::{BatchJobDriver, DriverPass, TableSummary};
pub use job::ArchiveCleanJob;
pub use machine::ArchiveCleanStateMachine;
pub use state::{BatchLag, PassOutcome, TableJobState};

/// `archive-clean` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveCleanConfig {
    /// Rows per batch, unless a table overrides it.
    pub batch_size: u64,
    /// A table with more retries than this is timed out.
    pub retry_ceiling: u32,
    /// Tables to process, in order.
    pub tables: Vec<TableConfig>,
}

impl Default for ArchiveCleanConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            retry_ceiling: 3,
            tables: Vec::new(),
        }
    }
}

impl ArchiveCleanConfig {
    /// Reject configurations the protocol cannot run safely.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidParams("batch_size must be positive".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for table in &self.tables {
            if table.name.is_empty() || table.expiry_column.is_empty() {
                return Err(Error::InvalidParams(
                    "every table needs a name and an expiry_column".into(),
                ));
            }
            if table.key_columns.is_empty() {
                return Err(Error::InvalidParams(format!(
                    "table '{}' has no key_columns",
                    table.name
                )));
            }
            if table.batch_size == Some(0) {
                return Err(Error::InvalidParams(format!(
                    "table '{}' has a zero batch_size",
                    table.name
                )));
            }
            // Summaries and errors are keyed by table name
            if !seen.insert(table.name.as_str()) {
                return Err(Error::InvalidParams(format!(
                    "table '{}' is configured more than once",
                    table.name
                )));
            }
        }
        Ok(())
    }
}

/// How a table stores its expiry column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryFormat {
    /// Integer seconds since the epoch.
    #[default]
    UnixSeconds,
    /// Integer milliseconds since the epoch.
    UnixMillis,
    /// `YYYY-MM-DD HH:MM:SS` text in UTC.
    Datetime,
    /// RFC 3339 text in UTC with a `Z` suffix.
    Rfc3339,
}

/// One logical table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Table in the primary store.
    pub name: String,
    /// Table in the secondary store. Defaults to `name`.
    #[serde(default)]
    pub archive_table: Option<String>,
    /// Columns identifying a row.
    #[serde(default = "default_key_columns")]
    pub key_columns: Vec<String>,
    /// Rows with this column below the cutoff are expiring.
    pub expiry_column: String,
    /// Encoding of the expiry column.
    #[serde(default)]
    pub expiry_format: ExpiryFormat,
    /// Cutoff is this many seconds before the run's start time.
    #[serde(default)]
    pub retention_secs: u64,
    /// Copy rows to the secondary store before deleting them.
    #[serde(default = "default_true")]
    pub archive: bool,
    /// Delete rows from the primary store.
    #[serde(default = "default_true")]
    pub clean: bool,
    /// Per-table batch size.
    #[serde(default)]
    pub batch_size: Option<u64>,
}

fn default_key_columns() -> Vec<String> {
    vec!["id".to_string()]
}

fn default_true() -> bool {
    true
}

impl TableConfig {
    /// Table keyed by `id`, archived and cleaned, expiring on `expiry_column`.
    pub fn new(name: impl Into<String>, expiry_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            archive_table: None,
            key_columns: default_key_columns(),
            expiry_column: expiry_column.into(),
            expiry_format: ExpiryFormat::default(),
            retention_secs: 0,
            archive: true,
            clean: true,
            batch_size: None,
        }
    }

    /// Secondary-store table name.
    pub fn archive_table_name(&self) -> &str {
        self.archive_table.as_deref().unwrap_or(&self.name)
    }

    /// Value the expiry column is compared against for a run started at
    /// `start_time`.
    pub fn expiry_threshold(&self, start_time: DateTime<Utc>) -> Value {
        let retention = i64::try_from(self.retention_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        let cutoff = start_time
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        match self.expiry_format {
            ExpiryFormat::UnixSeconds => json!(cutoff.timestamp()),
            ExpiryFormat::UnixMillis => json!(cutoff.timestamp_millis()),
            ExpiryFormat::Datetime => json!(cutoff.format("%Y-%m-%d %H:%M:%S").to_string()),
            ExpiryFormat::Rfc3339 => json!(cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}
