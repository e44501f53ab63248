// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The select / archive / clean protocol for one table.
//!
//! No row leaves the primary store before it has been copied to the
//! secondary store. When the primary delete fails after a fresh copy, the
//! copy is deleted again so the retry cannot leave a duplicate behind. If
//! that compensating delete fails too, the table is catastrophic.

use std::sync::Arc;

use cronwork_store::{InsertOptions, Predicate, Row, SelectOptions, SortOrder, Store};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::TableConfig;
use super::state::{BatchLag, PassOutcome, TableJobState};

/// Runs passes for one table against a primary and a secondary store.
#[derive(Clone)]
pub struct ArchiveCleanStateMachine {
    primary: Arc<dyn Store>,
    secondary: Arc<dyn Store>,
    table: TableConfig,
    batch_size: u64,
    threshold: Value,
}

impl ArchiveCleanStateMachine {
    /// Rows whose expiry column is below `threshold` are expiring.
    pub fn new(
        primary: Arc<dyn Store>,
        secondary: Arc<dyn Store>,
        table: TableConfig,
        batch_size: u64,
        threshold: Value,
    ) -> Self {
        Self {
            primary,
            secondary,
            table,
            batch_size: batch_size.max(1),
            threshold,
        }
    }

    /// Table configuration.
    pub fn table(&self) -> &TableConfig {
        &self.table
    }

    /// Run one pass. Does not touch `state`; the caller applies the outcome.
    ///
    /// Under `dry_run` the batch is selected and counted but neither phase
    /// writes.
    pub async fn pass(&self, state: &TableJobState, dry_run: bool) -> PassOutcome {
        let name = self.table.name.as_str();

        // One extra row tells us whether this is the final batch
        let options = SelectOptions::default()
            .order_by(self.table.expiry_column.clone(), SortOrder::Asc)
            .limit(self.batch_size + 1)
            .offset(self.batch_size * state.batch_iteration);
        let options = self
            .table
            .key_columns
            .iter()
            .fold(options, |o, key| o.order_by(key.clone(), SortOrder::Asc));
        let predicate = Predicate::lt(self.table.expiry_column.clone(), self.threshold.clone());

        let mut batch = match self.primary.select(name, &predicate, &options).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(table = %name, error = %e, "Select failed");
                return PassOutcome::RetrySelect {
                    error: e.to_string(),
                };
            }
        };
        if batch.is_empty() {
            debug!(table = %name, "No expiring rows");
            return PassOutcome::Finished;
        }
        let last_batch = batch.len() as u64 <= self.batch_size;
        batch.truncate(self.batch_size as usize);
        let rows = batch.len() as u64;

        if dry_run {
            debug!(table = %name, rows, "Dry run, skipping archive and clean");
            return PassOutcome::Success {
                rows,
                removed: false,
                last_batch,
            };
        }

        let archived_now = self.table.archive && state.batch_lag != BatchLag::Clean;
        if archived_now && let Err(e) = self.archive(&batch).await {
            warn!(table = %name, rows, error = %e, "Archive failed");
            return PassOutcome::RetryArchive {
                error: e.to_string(),
            };
        }

        if !self.table.clean {
            return PassOutcome::Success {
                rows,
                removed: false,
                last_batch,
            };
        }

        let keys = Predicate::for_keys(&self.table.key_columns, &batch);
        match self.primary.delete(name, &keys).await {
            Ok(deleted) => {
                if deleted < rows {
                    debug!(table = %name, rows, deleted, "Some rows were already gone");
                }
                PassOutcome::Success {
                    rows: deleted,
                    removed: true,
                    last_batch,
                }
            }
            Err(clean_err) => {
                warn!(table = %name, rows, error = %clean_err, "Clean failed");
                if !archived_now {
                    return PassOutcome::RetryClean {
                        error: clean_err.to_string(),
                        rearchive: false,
                    };
                }
                match self
                    .secondary
                    .delete(self.table.archive_table_name(), &keys)
                    .await
                {
                    Ok(_) => PassOutcome::RetryClean {
                        error: clean_err.to_string(),
                        rearchive: true,
                    },
                    Err(comp_err) => {
                        error!(
                            table = %name,
                            archive_table = %self.table.archive_table_name(),
                            clean_error = %clean_err,
                            compensation_error = %comp_err,
                            "Compensating delete failed, table needs manual intervention"
                        );
                        PassOutcome::Catastrophic {
                            clean_error: clean_err.to_string(),
                            compensation_error: comp_err.to_string(),
                        }
                    }
                }
            }
        }
    }

    async fn archive(&self, batch: &[Row]) -> cronwork_store::Result<u64> {
        self.secondary
            .insert(self.table.archive_table_name(), batch, &InsertOptions::upsert())
            .await
    }
}

impl std::fmt::Debug for ArchiveCleanStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveCleanStateMachine")
            .field("table", &self.table.name)
            .field("primary", &self.primary.backend())
            .field("secondary", &self.secondary.backend())
            .field("batch_size", &self.batch_size)
            .field("threshold", &self.threshold)
            .finish()
    }
}
