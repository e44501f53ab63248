// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching stored logs against notification rules.
//!
//! Both stages are pure: group digests from logs and rules, then user
//! digests from group digests and membership. Log indices refer to
//! positions in the input slice.

use std::collections::{BTreeMap, BTreeSet};

use cronwork_store::Row;
use serde::Serialize;
use serde_json::Value;

/// A stored log row as the matcher sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredLog {
    /// Row id, when the log table has one.
    pub id: Option<i64>,
    /// Producer channel.
    pub channel: String,
    /// Severity.
    pub level: i64,
    /// Seconds since the epoch.
    pub created: f64,
    /// Origin.
    pub node: Option<String>,
    /// Encoded `{"message", "context"}` payload.
    pub message: Option<String>,
}

impl StoredLog {
    /// Log at `channel` / `level` with no other data.
    pub fn new(channel: impl Into<String>, level: i64) -> Self {
        Self {
            id: None,
            channel: channel.into(),
            level,
            created: 0.0,
            node: None,
            message: None,
        }
    }

    /// Set the creation time.
    pub fn at(mut self, created: f64) -> Self {
        self.created = created;
        self
    }

    /// Read a log-table row. `None` when channel or level is missing.
    pub fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.get("id").and_then(Value::as_i64),
            channel: row.get("Channel")?.as_str()?.to_string(),
            level: row.get("Log_Level").and_then(as_level)?,
            created: row.get("Created").and_then(Value::as_f64).unwrap_or(0.0),
            node: row.get("Node").and_then(Value::as_str).map(str::to_string),
            message: row.get("Message").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// A group following `channel` at `min_level` or above for `report_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleGroup {
    /// Followed channel.
    pub channel: String,
    /// Lowest matching level.
    pub min_level: i64,
    /// Report this rule feeds.
    pub report_type: String,
    /// Kind of group.
    pub group_type: String,
    /// Group identifier.
    pub group_id: String,
    /// Display title.
    pub title: Option<String>,
}

impl RuleGroup {
    /// Rule for `group_id` with no title and group type `group`.
    pub fn new(
        channel: impl Into<String>,
        min_level: i64,
        report_type: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            min_level,
            report_type: report_type.into(),
            group_type: "group".to_string(),
            group_id: group_id.into(),
            title: None,
        }
    }

    /// Read a rules-table row. `None` when a required column is missing.
    pub fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            channel: row.get("channel")?.as_str()?.to_string(),
            min_level: row.get("min_level").and_then(as_level)?,
            report_type: row.get("report_type")?.as_str()?.to_string(),
            group_type: row
                .get("group_type")
                .and_then(Value::as_str)
                .unwrap_or("group")
                .to_string(),
            group_id: value_key(row.get("group_id")?),
            title: row.get("title").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Integer level from a number or numeric text. Fractional levels are
/// rejected rather than rounded.
fn as_level(value: &Value) -> Option<i64> {
    let integral = |f: f64| {
        (f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64)
            .then_some(f as i64)
    };
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse().ok().or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

/// String form of an identifier value.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Matching behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// Only rules for this report type; all rules when `None`.
    pub report_type: Option<String>,
    /// Fill `earliest_log_time` / `latest_log_time`.
    pub track_time_bounds: bool,
}

/// Logs matched by one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupDigest {
    /// Group identifier.
    pub group_id: String,
    /// Kind of group.
    pub group_type: String,
    /// Display title of the first matching rule that has one.
    pub title: Option<String>,
    /// Matched indices per rule channel and rule minimum level.
    pub rule_log_indexes: BTreeMap<String, BTreeMap<i64, Vec<usize>>>,
    /// Highest matched level.
    pub highest_log_level: i64,
    /// Earliest matched creation time.
    pub earliest_log_time: Option<f64>,
    /// Latest matched creation time.
    pub latest_log_time: Option<f64>,
    /// Every matched index, deduplicated.
    pub all_log_indexes: BTreeSet<usize>,
}

impl GroupDigest {
    fn new(rule: &RuleGroup) -> Self {
        Self {
            group_id: rule.group_id.clone(),
            group_type: rule.group_type.clone(),
            title: rule.title.clone(),
            rule_log_indexes: BTreeMap::new(),
            highest_log_level: i64::MIN,
            earliest_log_time: None,
            latest_log_time: None,
            all_log_indexes: BTreeSet::new(),
        }
    }

    /// Nothing matched.
    pub fn is_empty(&self) -> bool {
        self.all_log_indexes.is_empty()
    }
}

/// Logs a user should hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserDigest {
    /// User identifier.
    pub user_id: String,
    /// Groups that contributed, in contribution order.
    pub all_groups: Vec<String>,
    /// Highest level across the groups.
    pub highest_log_level: i64,
    /// Every matched index across the groups.
    pub all_log_indexes: BTreeSet<usize>,
    /// Extra profile fields requested by the caller.
    #[serde(flatten)]
    pub profile: BTreeMap<String, Value>,
}

/// Match `logs` against `rules`, keyed by group id.
///
/// A log matches a rule when the channels are equal and the log's level is
/// at least the rule's `min_level`. Rules for channels absent from the
/// batch, or with a `min_level` above anything in their channel, are
/// dropped before matching. Groups with no match are omitted.
pub fn compute_group_digests(
    logs: &[StoredLog],
    rules: &[RuleGroup],
    options: &MatchOptions,
) -> BTreeMap<String, GroupDigest> {
    let mut by_channel_level: BTreeMap<(&str, i64), Vec<usize>> = BTreeMap::new();
    let mut max_level: BTreeMap<&str, i64> = BTreeMap::new();
    for (index, log) in logs.iter().enumerate() {
        by_channel_level
            .entry((log.channel.as_str(), log.level))
            .or_default()
            .push(index);
        max_level
            .entry(log.channel.as_str())
            .and_modify(|m| *m = (*m).max(log.level))
            .or_insert(log.level);
    }

    let candidates = rules.iter().filter(|rule| {
        options
            .report_type
            .as_ref()
            .is_none_or(|t| *t == rule.report_type)
            && max_level
                .get(rule.channel.as_str())
                .is_some_and(|max| rule.min_level <= *max)
    });

    let mut digests: BTreeMap<String, GroupDigest> = BTreeMap::new();
    for rule in candidates {
        let channel = rule.channel.as_str();
        let matched = by_channel_level
            .range((channel, rule.min_level)..=(channel, i64::MAX))
            .flat_map(|(_, indexes)| indexes.iter().copied());

        let digest = digests
            .entry(rule.group_id.clone())
            .or_insert_with(|| GroupDigest::new(rule));
        if digest.title.is_none() {
            digest.title = rule.title.clone();
        }

        for index in matched {
            let log = &logs[index];
            digest
                .rule_log_indexes
                .entry(rule.channel.clone())
                .or_default()
                .entry(rule.min_level)
                .or_default()
                .push(index);
            digest.highest_log_level = digest.highest_log_level.max(log.level);
            digest.all_log_indexes.insert(index);
            if options.track_time_bounds {
                digest.earliest_log_time = Some(
                    digest
                        .earliest_log_time
                        .map_or(log.created, |t| t.min(log.created)),
                );
                digest.latest_log_time = Some(
                    digest
                        .latest_log_time
                        .map_or(log.created, |t| t.max(log.created)),
                );
            }
        }
    }

    digests.retain(|_, digest| !digest.is_empty());
    digests
}

/// Merge group digests into per-user digests.
///
/// `membership` maps group id to member user ids. Empty digests and groups
/// without members contribute nothing.
pub fn compute_user_digests(
    group_digests: &BTreeMap<String, GroupDigest>,
    membership: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, UserDigest> {
    let mut users: BTreeMap<String, UserDigest> = BTreeMap::new();

    for (group_id, digest) in group_digests {
        if digest.is_empty() {
            continue;
        }
        let Some(members) = membership.get(group_id) else {
            continue;
        };
        for user_id in members {
            let user = users
                .entry(user_id.clone())
                .or_insert_with(|| UserDigest {
                    user_id: user_id.clone(),
                    all_groups: Vec::new(),
                    highest_log_level: digest.highest_log_level,
                    all_log_indexes: BTreeSet::new(),
                    profile: BTreeMap::new(),
                });
            user.highest_log_level = user.highest_log_level.max(digest.highest_log_level);
            user.all_log_indexes
                .extend(digest.all_log_indexes.iter().copied());
            if !user.all_groups.contains(group_id) {
                user.all_groups.push(group_id.clone());
            }
        }
    }

    users
}

/// Copy `fields` from each user's profile row into their digest.
pub fn attach_profiles(
    users: &mut BTreeMap<String, UserDigest>,
    profiles: &BTreeMap<String, Row>,
    fields: &[String],
) {
    for (user_id, digest) in users.iter_mut() {
        let Some(profile) = profiles.get(user_id) else {
            continue;
        };
        for field in fields {
            if let Some(value) = profile.get(field) {
                digest.profile.insert(field.clone(), value.clone());
            }
        }
    }
}
