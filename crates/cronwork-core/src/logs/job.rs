// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `log-drain` job.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::drain::{DrainPass, FileSummary, LogDrain};
use crate::error::Result;
use crate::runtime::{Job, JobContext, StepOutcome};

/// Drains rotated log files one per pass until the budget runs out, or
/// until a pass finds nothing when `exit_when_idle` is set.
#[derive(Debug)]
pub struct LogDrainJob {
    drain: LogDrain,
    exit_when_idle: bool,
    files: BTreeMap<String, FileSummary>,
}

impl LogDrainJob {
    /// Job identifier.
    pub const ID: &'static str = "log-drain";

    /// Wrap a configured drain.
    pub fn new(drain: LogDrain, exit_when_idle: bool) -> Self {
        Self {
            drain,
            exit_when_idle,
            files: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl Job for LogDrainJob {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&mut self, ctx: &mut JobContext) -> Result<StepOutcome> {
        match self.drain.pass(ctx).await? {
            DrainPass::Processed { path, summary } => {
                let file = path.to_string_lossy().into_owned();
                let mut result = serde_json::Map::new();
                result.insert(file.clone(), serde_json::to_value(&summary)?);
                self.files.insert(file, summary);
                Ok(StepOutcome::proceed(Value::Object(result)))
            }
            DrainPass::Idle { candidates } => {
                let result = json!({});
                if self.exit_when_idle {
                    tracing::debug!(candidates, "No drainable log files");
                    Ok(StepOutcome::exit(result))
                } else {
                    Ok(StepOutcome::proceed(result))
                }
            }
        }
    }

    async fn after(&mut self, _ctx: &mut JobContext, _last: Option<Value>) -> Value {
        serde_json::to_value(&self.files).unwrap_or_default()
    }
}
