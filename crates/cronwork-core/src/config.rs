// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cronwork.
//!
//! Process-level settings come from the environment ([`Config::from_env`]);
//! per-job settings come from a JSON parameters file ([`JobParams`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::archive::ArchiveCleanConfig;
use crate::fanout::ReportFanoutConfig;
use crate::logs::LogDrainConfig;
use crate::queue::QueueConsumerConfig;

/// Environment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database holding the rows to archive and clean.
    pub primary_database_url: String,
    /// Database receiving archived rows. Defaults to the primary.
    pub secondary_database_url: String,
    /// Database holding logs, rules and the work queue. Defaults to the primary.
    pub log_database_url: String,
    /// Wall-clock budget for one invocation.
    pub max_runtime: Duration,
    /// Directory for advisory lock files.
    pub lock_dir: PathBuf,
    /// Lock files older than this are considered abandoned.
    pub lock_stale_after: Duration,
    /// Select but never write.
    pub dry_run: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let primary_database_url = std::env::var("CRONWORK_PRIMARY_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CRONWORK_PRIMARY_DATABASE_URL"))?;

        let secondary_database_url = std::env::var("CRONWORK_SECONDARY_DATABASE_URL")
            .unwrap_or_else(|_| primary_database_url.clone());

        let log_database_url = std::env::var("CRONWORK_LOG_DATABASE_URL")
            .unwrap_or_else(|_| primary_database_url.clone());

        let max_runtime = Duration::from_secs(parse_secs("CRONWORK_MAX_RUNTIME_SECS", 55)?);

        let lock_dir = PathBuf::from(
            std::env::var("CRONWORK_LOCK_DIR").unwrap_or_else(|_| ".data/locks".to_string()),
        );

        let lock_stale_after =
            Duration::from_secs(parse_secs("CRONWORK_LOCK_STALE_SECS", 3600)?);

        let dry_run = std::env::var("CRONWORK_DRY_RUN")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            primary_database_url,
            secondary_database_url,
            log_database_url,
            max_runtime,
            lock_dir,
            lock_stale_after,
            dry_run,
        })
    }
}

fn parse_secs(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable does not parse.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// The job parameters file could not be read or parsed.
    #[error("Invalid job parameters in {path}: {details}")]
    Params {
        /// Parameters file.
        path: PathBuf,
        /// What went wrong.
        details: String,
    },
}

/// Per-job parameters, one section per job type.
///
/// Every section is optional; a missing section takes its defaults.
///
/// ```json
/// {
///   "archive_clean": {
///     "batch_size": 500,
///     "tables": [{ "name": "sessions", "expiry_column": "expires_at" }]
///   },
///   "log_drain": { "folder": "/var/log/app", "pattern": "*.log.*" }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobParams {
    /// `archive-clean` parameters.
    pub archive_clean: ArchiveCleanConfig,
    /// `log-drain` parameters.
    pub log_drain: LogDrainConfig,
    /// `report-fanout` parameters.
    pub report_fanout: ReportFanoutConfig,
    /// `queue-consumer` parameters.
    pub queue_consumer: QueueConsumerConfig,
}

impl JobParams {
    /// Load parameters from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Params {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Params {
            path: path.to_path_buf(),
            details: e.to_string(),
        })
    }
}
