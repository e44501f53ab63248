// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-table state and its transition function.

use serde::Serialize;

/// Which phase owes a retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchLag {
    /// Nothing owed.
    #[default]
    None,
    /// The archive copy failed or was undone; the batch is re-archived.
    Archive,
    /// The archive copy exists, only the primary delete is owed.
    Clean,
    /// Clean and its compensation both failed. Terminal for the run.
    Catastrophic,
}

/// Result of one pass over one table.
///
/// Carries the net effect of the pass so [`TableJobState::apply`] can be a
/// single exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The batch went through every enabled phase.
    Success {
        /// Rows archived and cleaned (or archived only, or selected only).
        rows: u64,
        /// Rows left the primary store, so the page offset stays put.
        removed: bool,
        /// No expiring rows remain beyond this batch.
        last_batch: bool,
    },
    /// The select returned nothing.
    Finished,
    /// The select failed.
    RetrySelect {
        /// Store failure detail.
        error: String,
    },
    /// The archive copy failed.
    RetryArchive {
        /// Store failure detail.
        error: String,
    },
    /// The primary delete failed and the table is safe to retry.
    RetryClean {
        /// Store failure detail.
        error: String,
        /// The archive copy was undone by the compensating delete, so the
        /// retry must archive again.
        rearchive: bool,
    },
    /// The primary delete and the compensating delete both failed.
    Catastrophic {
        /// Primary delete failure.
        clean_error: String,
        /// Compensating delete failure.
        compensation_error: String,
    },
}

/// Progress of one logical table within one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableJobState {
    /// Table name.
    pub name: String,
    /// Failed attempts so far.
    pub retries: u32,
    /// Page index of the next unfetched batch.
    pub batch_iteration: u64,
    /// Phase owed a retry.
    pub batch_lag: BatchLag,
    /// Rows fully handled.
    pub success: u64,
    /// No expiring rows remain.
    pub finished: bool,
}

impl TableJobState {
    /// Fresh state for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retries: 0,
            batch_iteration: 0,
            batch_lag: BatchLag::None,
            success: 0,
            finished: false,
        }
    }

    /// Retries exceeded the ceiling.
    pub fn is_timed_out(&self, retry_ceiling: u32) -> bool {
        self.retries > retry_ceiling
    }

    /// Needs an operator.
    pub fn is_catastrophic(&self) -> bool {
        self.batch_lag == BatchLag::Catastrophic
    }

    /// No further passes this run.
    pub fn is_resolved(&self, retry_ceiling: u32) -> bool {
        self.finished || self.is_timed_out(retry_ceiling) || self.is_catastrophic()
    }

    /// Apply a pass outcome.
    ///
    /// Failures leave `batch_iteration` where it was so the same batch is
    /// fetched again. A success advances it only when the rows stayed in the
    /// primary store; removed rows no longer occupy offsets.
    pub fn apply(&mut self, outcome: &PassOutcome) {
        match outcome {
            PassOutcome::Success {
                rows,
                removed,
                last_batch,
            } => {
                if !removed {
                    self.batch_iteration += 1;
                }
                self.success += rows;
                self.batch_lag = BatchLag::None;
                self.finished = *last_batch;
            }
            PassOutcome::Finished => self.finished = true,
            PassOutcome::RetrySelect { .. } => self.retries += 1,
            PassOutcome::RetryArchive { .. } => {
                self.retries += 1;
                self.batch_lag = BatchLag::Archive;
            }
            PassOutcome::RetryClean { rearchive, .. } => {
                self.retries += 1;
                self.batch_lag = if *rearchive {
                    BatchLag::Archive
                } else {
                    BatchLag::Clean
                };
            }
            PassOutcome::Catastrophic { .. } => self.batch_lag = BatchLag::Catastrophic,
        }
    }
}
