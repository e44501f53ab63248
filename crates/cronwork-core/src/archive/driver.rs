// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One pass over every configured table.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::machine::ArchiveCleanStateMachine;
use super::state::{BatchLag, PassOutcome, TableJobState};
use crate::error::ErrorCause;
use crate::runtime::JobContext;

/// Per-table progress reported after each pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    /// Table name.
    pub name: String,
    /// Failed attempts so far.
    pub retries: u32,
    /// Rows fully handled.
    pub successful_items: u64,
    /// No expiring rows remain.
    pub finished: bool,
    /// Phase owed a retry.
    pub batch_lag: BatchLag,
}

impl From<&TableJobState> for TableSummary {
    fn from(state: &TableJobState) -> Self {
        Self {
            name: state.name.clone(),
            retries: state.retries,
            successful_items: state.success,
            finished: state.finished,
            batch_lag: state.batch_lag,
        }
    }
}

/// Result of one driver pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPass {
    /// Every table is finished, timed out or catastrophic.
    pub exit: bool,
    /// Summaries for every table, resolved or not.
    pub summaries: Vec<TableSummary>,
}

/// Advances every unresolved table by one pass.
#[derive(Debug)]
pub struct BatchJobDriver {
    tables: Vec<(ArchiveCleanStateMachine, TableJobState)>,
    retry_ceiling: u32,
}

impl BatchJobDriver {
    /// Driver over `machines`, each starting from a fresh state.
    pub fn new(machines: Vec<ArchiveCleanStateMachine>, retry_ceiling: u32) -> Self {
        let tables = machines
            .into_iter()
            .map(|m| {
                let state = TableJobState::new(m.table().name.clone());
                (m, state)
            })
            .collect();
        Self {
            tables,
            retry_ceiling,
        }
    }

    /// Current table states.
    pub fn states(&self) -> impl Iterator<Item = &TableJobState> {
        self.tables.iter().map(|(_, state)| state)
    }

    /// Every table is resolved.
    pub fn is_done(&self) -> bool {
        self.states().all(|s| s.is_resolved(self.retry_ceiling))
    }

    /// Run one pass over every unresolved table, stopping early when the
    /// budget runs out.
    pub async fn pass(&mut self, ctx: &mut JobContext) -> DriverPass {
        let ceiling = self.retry_ceiling;

        for (machine, state) in self.tables.iter_mut() {
            if state.is_resolved(ceiling) {
                continue;
            }
            if ctx.budget.is_exhausted() {
                debug!(table = %state.name, "Budget exhausted before table pass");
                break;
            }

            let outcome = machine.pass(state, ctx.dry_run).await;
            record(ctx, &state.name, &outcome);
            state.apply(&outcome);

            if ctx.single_pass {
                state.finished = true;
            }
            if state.is_timed_out(ceiling) && !state.finished {
                warn!(table = %state.name, retries = state.retries, "Table exceeded retry ceiling");
                ctx.record_error(
                    ErrorCause::TimedOut,
                    &state.name,
                    format!("{} retries exceeded ceiling of {}", state.retries, ceiling),
                );
            }

            ctx.progress(&format!(
                "{}: retries={} success={} iteration={} lag={:?} finished={}",
                state.name,
                state.retries,
                state.success,
                state.batch_iteration,
                state.batch_lag,
                state.finished
            ));
        }

        let resolved = self
            .states()
            .filter(|s| s.is_resolved(ceiling))
            .count();
        let exit = resolved == self.tables.len();
        if exit {
            info!(tables = self.tables.len(), "All tables resolved");
        }

        DriverPass {
            exit,
            summaries: self.states().map(TableSummary::from).collect(),
        }
    }
}

fn record(ctx: &mut JobContext, table: &str, outcome: &PassOutcome) {
    match outcome {
        PassOutcome::Success { .. } | PassOutcome::Finished => {}
        PassOutcome::RetrySelect { error } => {
            ctx.record_error(ErrorCause::SelectFailed, table, error.clone())
        }
        PassOutcome::RetryArchive { error } => {
            ctx.record_error(ErrorCause::ArchiveFailed, table, error.clone())
        }
        PassOutcome::RetryClean { error, .. } => {
            ctx.record_error(ErrorCause::CleanFailed, table, error.clone())
        }
        PassOutcome::Catastrophic {
            clean_error,
            compensation_error,
        } => {
            error!(table = %table, "Table is catastrophic");
            ctx.record_error(
                ErrorCause::Catastrophic,
                table,
                format!(
                    "clean failed ({}) and compensating archive delete failed ({}); manual intervention required",
                    clean_error, compensation_error
                ),
            );
        }
    }
}
