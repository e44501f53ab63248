// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `report-fanout` job.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronwork_store::{Predicate, Row, SelectOptions, SortOrder, Store};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::ReportFanoutConfig;
use super::matcher::{
    MatchOptions, RuleGroup, StoredLog, attach_profiles, compute_group_digests,
    compute_user_digests, value_key,
};
use super::sink::{DigestSink, FanoutBatch};
use crate::error::{ErrorCause, Result};
use crate::runtime::{Job, JobContext, StepOutcome};

/// Matches the last `lookback` of logs against notification rules and
/// hands the per-user digests to a [`DigestSink`]. Runs once.
pub struct ReportFanoutJob {
    config: ReportFanoutConfig,
    store: Arc<dyn Store>,
    sink: Arc<dyn DigestSink>,
    now: Option<DateTime<Utc>>,
    users: BTreeMap<String, Value>,
}

impl ReportFanoutJob {
    /// Job identifier.
    pub const ID: &'static str = "report-fanout";

    /// Logs, rules, members and users are all read from `store`.
    pub fn new(config: ReportFanoutConfig, store: Arc<dyn Store>, sink: Arc<dyn DigestSink>) -> Self {
        Self {
            config,
            store,
            sink,
            now: None,
            users: BTreeMap::new(),
        }
    }

    /// Fix the window end instead of using the wall clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Load everything and compute the digests.
    pub async fn build_batch(&self) -> Result<FanoutBatch> {
        let cfg = &self.config;
        let now = self.now.unwrap_or_else(Utc::now);
        let window_end = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
        let window_start = window_end - cfg.lookback_secs as f64;

        let log_rows = self
            .store
            .select(
                &cfg.log_table,
                &Predicate::And(vec![
                    Predicate::ge("Created", window_start),
                    Predicate::lt("Created", window_end),
                ]),
                &SelectOptions::default()
                    .order_by("Created", SortOrder::Asc)
                    .limit(cfg.max_logs),
            )
            .await?;
        let logs: Vec<StoredLog> = log_rows.iter().filter_map(StoredLog::from_row).collect();
        if logs.len() < log_rows.len() {
            debug!(skipped = log_rows.len() - logs.len(), "Log rows without a channel or an integral level");
        }

        let rules: Vec<RuleGroup> = if logs.is_empty() {
            Vec::new()
        } else {
            self.store
                .select(
                    &cfg.rules_table,
                    &Predicate::eq("report_type", cfg.report_type.clone()),
                    &SelectOptions::default(),
                )
                .await?
                .iter()
                .filter_map(RuleGroup::from_row)
                .collect()
        };

        let options = MatchOptions {
            report_type: Some(cfg.report_type.clone()),
            track_time_bounds: cfg.track_time_bounds,
        };
        let groups = compute_group_digests(&logs, &rules, &options);

        let membership = self.load_membership(groups.keys()).await?;
        let mut users = compute_user_digests(&groups, &membership.members);

        if !cfg.profile_fields.is_empty() && !users.is_empty() {
            let profiles = self
                .load_profiles(users.keys().filter_map(|id| membership.raw_ids.get(id)))
                .await?;
            attach_profiles(&mut users, &profiles, &cfg.profile_fields);
        }

        Ok(FanoutBatch {
            report_type: cfg.report_type.clone(),
            window_start,
            window_end,
            logs,
            groups,
            users,
        })
    }

    async fn load_membership<'a>(
        &self,
        group_ids: impl Iterator<Item = &'a String>,
    ) -> Result<Membership> {
        let ids: Vec<Value> = group_ids.map(|id| Value::String(id.clone())).collect();
        let mut membership = Membership::default();
        if ids.is_empty() {
            return Ok(membership);
        }

        let rows = self
            .store
            .select(
                &self.config.members_table,
                &Predicate::is_in("group_id", ids),
                &SelectOptions::default(),
            )
            .await?;
        for row in rows {
            let (Some(group), Some(user)) = (row.get("group_id"), row.get("user_id")) else {
                continue;
            };
            let user_key = value_key(user);
            membership.raw_ids.insert(user_key.clone(), user.clone());
            membership
                .members
                .entry(value_key(group))
                .or_default()
                .push(user_key);
        }
        Ok(membership)
    }

    async fn load_profiles<'a>(
        &self,
        user_ids: impl Iterator<Item = &'a Value>,
    ) -> Result<BTreeMap<String, Row>> {
        let key = &self.config.user_key_column;
        let ids: Vec<Value> = user_ids.cloned().collect();
        let mut columns = vec![key.clone()];
        columns.extend(self.config.profile_fields.iter().cloned());

        let rows = self
            .store
            .select(
                &self.config.users_table,
                &Predicate::is_in(key.clone(), ids),
                &SelectOptions::default().columns(columns),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| Some((value_key(row.get(key)?), row)))
            .collect())
    }
}

#[derive(Debug, Default)]
struct Membership {
    members: BTreeMap<String, Vec<String>>,
    raw_ids: BTreeMap<String, Value>,
}

#[async_trait]
impl Job for ReportFanoutJob {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn run(&mut self, ctx: &mut JobContext) -> Result<StepOutcome> {
        let batch = match self.build_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                ctx.record_error(ErrorCause::FanoutFailed, Self::ID, e.to_string());
                return Ok(StepOutcome::exit(json!({})));
            }
        };

        info!(
            logs = batch.logs.len(),
            groups = batch.groups.len(),
            users = batch.users.len(),
            "Fan-out computed"
        );

        if ctx.dry_run {
            debug!("Dry run, digests not delivered");
        } else if let Err(e) = self.sink.deliver(&batch).await {
            ctx.record_error(ErrorCause::FanoutFailed, Self::ID, e.to_string());
        }

        self.users = batch
            .users
            .values()
            .map(|user| {
                (
                    user.user_id.clone(),
                    json!({
                        "highest_log_level": user.highest_log_level,
                        "groups": user.all_groups,
                        "log_count": user.all_log_indexes.len(),
                    }),
                )
            })
            .collect();

        Ok(StepOutcome::exit(serde_json::to_value(&self.users)?))
    }

    async fn after(&mut self, _ctx: &mut JobContext, _last: Option<Value>) -> Value {
        serde_json::to_value(&self.users).unwrap_or_default()
    }
}

impl std::fmt::Debug for ReportFanoutJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportFanoutJob")
            .field("config", &self.config)
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}
