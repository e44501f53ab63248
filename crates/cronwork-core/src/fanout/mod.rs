// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Report fan-out: from stored logs to per-user digests.

use serde::Deserialize;

pub mod job;
pub mod matcher;
pub mod sink;

pub use job::ReportFanoutJob;
pub use matcher::{
    GroupDigest, MatchOptions, RuleGroup, StoredLog, UserDigest, attach_profiles,
    compute_group_digests, compute_user_digests,
};
pub use sink::{DigestSink, FanoutBatch, TracingDigestSink};

/// `report-fanout` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportFanoutConfig {
    /// Log table.
    pub log_table: String,
    /// Rules table.
    pub rules_table: String,
    /// Group membership table.
    pub members_table: String,
    /// User profile table.
    pub users_table: String,
    /// Identifier column of `users_table`.
    pub user_key_column: String,
    /// Rules with this report type are used.
    pub report_type: String,
    /// Window length ending now.
    pub lookback_secs: u64,
    /// Most logs read per run, oldest first.
    pub max_logs: u64,
    /// Profile columns copied into user digests.
    pub profile_fields: Vec<String>,
    /// Record earliest and latest matched log times.
    pub track_time_bounds: bool,
}

impl Default for ReportFanoutConfig {
    fn default() -> Self {
        Self {
            log_table: "logs".to_string(),
            rules_table: "log_rules".to_string(),
            members_table: "log_rule_members".to_string(),
            users_table: "users".to_string(),
            user_key_column: "id".to_string(),
            report_type: "digest".to_string(),
            lookback_secs: 3600,
            max_logs: 10_000,
            profile_fields: Vec::new(),
            track_time_bounds: true,
        }
    }
}
