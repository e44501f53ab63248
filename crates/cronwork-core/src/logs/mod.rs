// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log drain: rotated files into the log store.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub mod drain;
pub mod ingest;
pub mod job;
pub mod record;

pub use drain::{
    Candidate, DrainPass, FileRead, FileSummary, LocalFileSystem, LogDrain, LogFileSystem,
};
pub use ingest::LogIngestor;
pub use job::LogDrainJob;
pub use record::{LineError, LogRecord, ParsedBatch, parse_content};

/// `log-drain` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogDrainConfig {
    /// Folder holding rotated files.
    pub folder: PathBuf,
    /// File-name glob inside `folder`.
    pub pattern: String,
    /// Extra age required per position in the oldest-first order.
    pub log_file_interval_secs: u64,
    /// Age every file needs before it is touched.
    pub safety_margin_secs: u64,
    /// How long to wait for the advisory claim.
    pub lock_timeout_ms: u64,
    /// Pause after a pass that handled nothing.
    pub idle_wait_ms: u64,
    /// Finish the job after an idle pass.
    pub exit_when_idle: bool,
    /// Log table.
    pub log_table: String,
    /// Rows per insert.
    pub chunk_size: usize,
    /// Node recorded for lines without one. Defaults to `$HOSTNAME`.
    pub node: Option<String>,
}

impl Default for LogDrainConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from(".data/logs"),
            pattern: "*.log.*".to_string(),
            log_file_interval_secs: 60,
            safety_margin_secs: 5,
            lock_timeout_ms: 500,
            idle_wait_ms: 1000,
            exit_when_idle: true,
            log_table: "logs".to_string(),
            chunk_size: 500,
            node: None,
        }
    }
}

impl LogDrainConfig {
    /// Per-position age step.
    pub fn log_file_interval(&self) -> Duration {
        Duration::from_secs(self.log_file_interval_secs)
    }

    /// Base age.
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    /// Claim timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Idle pause.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}
