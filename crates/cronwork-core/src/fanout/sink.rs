// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Where computed digests go.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::matcher::{GroupDigest, StoredLog, UserDigest};
use crate::error::Result;

/// Everything a dispatcher needs to notify users about one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanoutBatch {
    /// Report the rules were filtered by.
    pub report_type: String,
    /// Window start, epoch seconds, inclusive.
    pub window_start: f64,
    /// Window end, epoch seconds, exclusive.
    pub window_end: f64,
    /// Logs the digest indices point into.
    pub logs: Vec<StoredLog>,
    /// Per-group digests.
    pub groups: BTreeMap<String, GroupDigest>,
    /// Per-user digests.
    pub users: BTreeMap<String, UserDigest>,
}

/// Receives one batch per fan-out run.
#[async_trait]
pub trait DigestSink: Send + Sync {
    /// Hand the batch on. An error is recorded against the job.
    async fn deliver(&self, batch: &FanoutBatch) -> Result<()>;
}

/// Logs one line per user.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDigestSink;

#[async_trait]
impl DigestSink for TracingDigestSink {
    async fn deliver(&self, batch: &FanoutBatch) -> Result<()> {
        for user in batch.users.values() {
            info!(
                report_type = %batch.report_type,
                user_id = %user.user_id,
                highest_log_level = user.highest_log_level,
                groups = ?user.all_groups,
                logs = user.all_log_indexes.len(),
                "Digest ready"
            );
        }
        Ok(())
    }
}
