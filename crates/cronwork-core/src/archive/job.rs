// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `archive-clean` job.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronwork_store::Store;
use serde_json::Value;
use tracing::info;

use super::ArchiveCleanConfig;
use super::driver::{BatchJobDriver, TableSummary};
use super::machine::ArchiveCleanStateMachine;
use crate::error::{Error, Result};
use crate::runtime::{Job, JobContext, StepOutcome};

/// Archives and cleans expiring rows of every configured table.
pub struct ArchiveCleanJob {
    config: ArchiveCleanConfig,
    primary: Arc<dyn Store>,
    secondary: Arc<dyn Store>,
    start_time: Option<DateTime<Utc>>,
    driver: Option<BatchJobDriver>,
}

impl ArchiveCleanJob {
    /// Job identifier.
    pub const ID: &'static str = "archive-clean";

    /// Rows are read from and deleted in `primary`, copied to `secondary`.
    pub fn new(
        config: ArchiveCleanConfig,
        primary: Arc<dyn Store>,
        secondary: Arc<dyn Store>,
    ) -> Self {
        Self {
            config,
            primary,
            secondary,
            start_time: None,
            driver: None,
        }
    }

    /// Fix the expiry reference time instead of taking it in `before`.
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    fn summaries(&self) -> BTreeMap<String, TableSummary> {
        self.driver
            .iter()
            .flat_map(|d| d.states())
            .map(|s| (s.name.clone(), TableSummary::from(s)))
            .collect()
    }
}

#[async_trait]
impl Job for ArchiveCleanJob {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn before(&mut self, _ctx: &mut JobContext) -> Result<()> {
        self.config.validate()?;
        let start_time = *self.start_time.get_or_insert_with(Utc::now);

        let machines = self
            .config
            .tables
            .iter()
            .map(|table| {
                let threshold = table.expiry_threshold(start_time);
                info!(
                    table = %table.name,
                    archive_table = %table.archive_table_name(),
                    threshold = %threshold,
                    archive = table.archive,
                    clean = table.clean,
                    "Table configured"
                );
                ArchiveCleanStateMachine::new(
                    Arc::clone(&self.primary),
                    Arc::clone(&self.secondary),
                    table.clone(),
                    table.batch_size.unwrap_or(self.config.batch_size),
                    threshold,
                )
            })
            .collect();

        self.driver = Some(BatchJobDriver::new(machines, self.config.retry_ceiling));
        Ok(())
    }

    async fn run(&mut self, ctx: &mut JobContext) -> Result<StepOutcome> {
        let driver = self
            .driver
            .as_mut()
            .ok_or_else(|| Error::Other("archive-clean run before setup".to_string()))?;

        let pass = driver.pass(ctx).await;
        let result = serde_json::to_value(
            pass.summaries
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect::<BTreeMap<_, _>>(),
        )?;

        Ok(StepOutcome {
            exit: pass.exit,
            result,
        })
    }

    async fn after(&mut self, _ctx: &mut JobContext, _last: Option<Value>) -> Value {
        serde_json::to_value(self.summaries()).unwrap_or_default()
    }
}

impl std::fmt::Debug for ArchiveCleanJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveCleanJob")
            .field("config", &self.config)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}
