// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cronwork-core.
//!
//! Two layers: [`Error`] is what a fallible call returns, [`ErrorMap`] is the
//! operator-facing record a job accumulates while it keeps running. Jobs
//! absorb non-catastrophic faults into the map instead of propagating them.

use std::collections::BTreeMap;

use cronwork_store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Message of the record the log drain writes when an ingest fails. The
/// drain filters it out of rotated files so a failing log store cannot feed
/// its own failure reports back into itself.
pub const INGEST_FAILURE_MESSAGE: &str = "Failed to insert logs";

/// Cronwork errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Advisory lock operation failed.
    #[error("Mutex error: {0}")]
    Mutex(#[from] crate::mutex::MutexError),

    /// Bulk log insert did not write every row.
    #[error("Failed to insert logs: {written} of {total} rows written: {source}")]
    Ingest {
        /// Rows confirmed written before the failure.
        written: u64,
        /// Rows in the batch.
        total: usize,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },

    /// Job tag is not registered.
    #[error("Unknown job type: {0}")]
    UnknownJob(String),

    /// Job parameters are unusable.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Queue primitive failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using cronwork Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an entry landed in the [`ErrorMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// `before` or `run` returned an error.
    JobFailed,
    /// Selecting the expiring batch failed.
    SelectFailed,
    /// Copying the batch to the secondary store failed.
    ArchiveFailed,
    /// Deleting the batch from the primary store failed.
    CleanFailed,
    /// Clean and its compensating delete both failed; needs an operator.
    Catastrophic,
    /// Table exceeded its retry ceiling.
    TimedOut,
    /// Reading a claimed log file failed.
    LogReadFailed,
    /// Writing parsed log lines to the log store failed.
    LogIngestFailed,
    /// Removing an ingested log file failed.
    LogDeleteFailed,
    /// Loading or matching data for the report fan-out failed.
    FanoutFailed,
    /// Receiving from the queue failed.
    QueueReceiveFailed,
    /// The message handler rejected a message.
    QueueHandlerFailed,
    /// A queue row that is not a message was removed from the queue.
    QueueMessageDiscarded,
}

impl ErrorCause {
    /// Returns the string representation of the cause.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobFailed => "job_failed",
            Self::SelectFailed => "select_failed",
            Self::ArchiveFailed => "archive_failed",
            Self::CleanFailed => "clean_failed",
            Self::Catastrophic => "catastrophic",
            Self::TimedOut => "timed_out",
            Self::LogReadFailed => "log_read_failed",
            Self::LogIngestFailed => "log_ingest_failed",
            Self::LogDeleteFailed => "log_delete_failed",
            Self::FanoutFailed => "fanout_failed",
            Self::QueueReceiveFailed => "queue_receive_failed",
            Self::QueueHandlerFailed => "queue_handler_failed",
            Self::QueueMessageDiscarded => "queue_message_discarded",
        }
    }
}

/// Accumulated errors, partitioned by cause and then by job (or sub-job) id.
///
/// Partitioning by cause keeps unrelated failures apart: one table's clean
/// failure never hides another table's select failure. A repeated
/// `(cause, id)` keeps the most recent detail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ErrorMap(BTreeMap<ErrorCause, BTreeMap<String, String>>);

impl ErrorMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `detail` for `id` under `cause`.
    pub fn record(&mut self, cause: ErrorCause, id: impl Into<String>, detail: impl Into<String>) {
        self.0
            .entry(cause)
            .or_default()
            .insert(id.into(), detail.into());
    }

    /// Detail recorded for `id` under `cause`.
    pub fn get(&self, cause: ErrorCause, id: &str) -> Option<&str> {
        self.0.get(&cause)?.get(id).map(String::as_str)
    }

    /// Whether anything was recorded under `cause`.
    pub fn has_cause(&self, cause: ErrorCause) -> bool {
        self.0.get(&cause).is_some_and(|ids| !ids.is_empty())
    }

    /// Total number of entries across all causes.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate `(cause, id, detail)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (ErrorCause, &str, &str)> {
        self.0.iter().flat_map(|(cause, ids)| {
            ids.iter()
                .map(move |(id, detail)| (*cause, id.as_str(), detail.as_str()))
        })
    }
}
