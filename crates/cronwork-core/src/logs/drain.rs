// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Claiming rotated log files and moving them into the log store.
//!
//! A file is only touched once it is old enough to be out of the producer's
//! write window. Reading requires two locks: the advisory [`FileMutex`]
//! claim, which keeps other cronwork processes away, and a shared `fd-lock`
//! read lock on the file itself, which waits out the producer's exclusive
//! write lock. The file is deleted only after every row was written.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::LogDrainConfig;
use super::ingest::LogIngestor;
use super::record::{ParsedBatch, parse_content};
use crate::error::{Error, ErrorCause, INGEST_FAILURE_MESSAGE, Result};
use crate::mutex::FileMutex;
use crate::runtime::JobContext;

/// A rotated file found by the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// File path.
    pub path: PathBuf,
    /// Last modification time.
    pub modified: SystemTime,
}

impl Candidate {
    /// Time since last modification; zero for timestamps in the future.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or_default()
    }
}

/// Outcome for one drained file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    /// Rows written to the log store.
    pub rows: u64,
    /// Lines that did not parse.
    pub skipped: usize,
    /// Ingest-failure records dropped.
    pub filtered: usize,
    /// The file was removed afterwards.
    pub deleted: bool,
}

/// Result of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainPass {
    /// One file was fully handled.
    Processed {
        /// The file.
        path: PathBuf,
        /// What happened to it.
        summary: FileSummary,
    },
    /// No file was handled.
    Idle {
        /// Files matching the pattern, eligible or not.
        candidates: usize,
    },
}

/// What a locked read found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRead {
    /// Full file contents, lossily decoded as UTF-8.
    Contents(String),
    /// The file disappeared after it was listed.
    Vanished,
    /// The producer still holds its write lock.
    Locked,
}

/// File operations the drain needs.
#[async_trait]
pub trait LogFileSystem: Send + Sync {
    /// Files under `folder` matching the glob `pattern`, oldest first.
    fn list_matching(&self, folder: &Path, pattern: &str) -> Result<Vec<Candidate>>;

    /// Read a whole file under a shared lock.
    async fn read_with_lock(&self, path: &Path) -> std::io::Result<FileRead>;

    /// Remove a file. `Ok(false)` when it was already gone.
    async fn delete(&self, path: &Path) -> std::io::Result<bool>;
}

/// The local file system, with `fd-lock` shared read locks.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

#[async_trait]
impl LogFileSystem for LocalFileSystem {
    fn list_matching(&self, folder: &Path, pattern: &str) -> Result<Vec<Candidate>> {
        let folder = glob::Pattern::escape(&folder.to_string_lossy());
        let full = format!("{}/{}", folder.trim_end_matches('/'), pattern);
        let paths = glob::glob(&full)
            .map_err(|e| Error::InvalidParams(format!("log pattern '{}': {}", full, e)))?;

        let mut candidates = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    debug!(error = %e, "Unreadable log path");
                    continue;
                }
            };
            // Files can vanish between listing and stat
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;
            candidates.push(Candidate { path, modified });
        }
        candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(candidates)
    }

    async fn read_with_lock(&self, path: &Path) -> std::io::Result<FileRead> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(FileRead::Vanished);
                }
                Err(e) => return Err(e),
            };
            let lock = fd_lock::RwLock::new(file);
            let guard = match lock.try_read() {
                Ok(guard) => guard,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(FileRead::Locked);
                }
                Err(e) => return Err(e),
            };
            let mut bytes = Vec::new();
            let mut reader: &File = &guard;
            reader.read_to_end(&mut bytes)?;
            Ok(FileRead::Contents(String::from_utf8_lossy(&bytes).into_owned()))
        })
        .await
        .map_err(std::io::Error::other)?
    }

    async fn delete(&self, path: &Path) -> std::io::Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Moves at most one rotated log file per pass into the log store.
pub struct LogDrain {
    config: LogDrainConfig,
    mutex: FileMutex,
    ingestor: LogIngestor,
    fs: Arc<dyn LogFileSystem>,
    node: String,
}

impl LogDrain {
    /// Drain files described by `config`.
    pub fn new(config: LogDrainConfig, mutex: FileMutex, ingestor: LogIngestor) -> Self {
        let node = config.node.clone().unwrap_or_else(default_node);
        Self {
            config,
            mutex,
            ingestor,
            fs: Arc::new(LocalFileSystem),
            node,
        }
    }

    /// Use another file system.
    pub fn with_file_system(mut self, fs: Arc<dyn LogFileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Files matching the pattern, oldest first.
    pub fn candidates(&self) -> Result<Vec<Candidate>> {
        self.fs.list_matching(&self.config.folder, &self.config.pattern)
    }

    /// Minimum age of the candidate at `index`.
    pub fn min_age(&self, index: usize) -> Duration {
        self.config
            .log_file_interval()
            .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX))
            .saturating_add(self.config.safety_margin())
    }

    /// Handle the first eligible file, or sleep briefly when there is none.
    pub async fn pass(&self, ctx: &mut JobContext) -> Result<DrainPass> {
        let candidates = self.candidates()?;
        let now = SystemTime::now();

        for (index, candidate) in candidates.iter().enumerate() {
            if ctx.budget.is_exhausted() {
                debug!("Budget exhausted during log scan");
                break;
            }
            let min_age = self.min_age(index);
            if candidate.age(now) < min_age {
                debug!(
                    file = %candidate.path.display(),
                    age_secs = candidate.age(now).as_secs(),
                    min_age_secs = min_age.as_secs(),
                    "Log file too young"
                );
                continue;
            }
            if let Some(summary) = self.drain_file(&candidate.path, ctx).await {
                return Ok(DrainPass::Processed {
                    path: candidate.path.clone(),
                    summary,
                });
            }
        }

        let wait = self.config.idle_wait().min(ctx.budget.remaining());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(DrainPass::Idle {
            candidates: candidates.len(),
        })
    }

    /// Claim, read, ingest and delete one file. `None` when it was skipped
    /// or failed; the claim is released on every path.
    async fn drain_file(&self, path: &Path, ctx: &mut JobContext) -> Option<FileSummary> {
        let key = path.to_string_lossy().into_owned();

        let claim = match self.mutex.claim(key.as_str()).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                debug!(file = %key, "Log file claimed elsewhere");
                return None;
            }
            Err(e) => {
                ctx.record_error(ErrorCause::LogReadFailed, &key, e.to_string());
                return None;
            }
        };

        let result = self.drain_claimed(path, &key, ctx).await;

        if let Err(e) = claim.release() {
            warn!(file = %key, error = %e, "Failed to release log file lock");
        }
        result
    }

    async fn drain_claimed(
        &self,
        path: &Path,
        key: &str,
        ctx: &mut JobContext,
    ) -> Option<FileSummary> {
        let contents = match self.fs.read_with_lock(path).await {
            Ok(FileRead::Contents(contents)) => contents,
            Ok(FileRead::Vanished) => {
                info!(file = %key, "Log file vanished before read");
                return None;
            }
            Ok(FileRead::Locked) => {
                debug!(file = %key, "Producer still holds log file");
                return None;
            }
            Err(e) => {
                ctx.record_error(ErrorCause::LogReadFailed, key, e.to_string());
                return None;
            }
        };

        let ParsedBatch {
            records,
            skipped,
            filtered,
        } = parse_content(&contents, &self.node);

        let rows = if ctx.dry_run {
            records.len() as u64
        } else {
            match self.ingestor.ingest(&records).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(file = %key, error = %e, "{}", INGEST_FAILURE_MESSAGE);
                    ctx.record_error(ErrorCause::LogIngestFailed, key, e.to_string());
                    return None;
                }
            }
        };

        let mut summary = FileSummary {
            rows,
            skipped,
            filtered,
            deleted: false,
        };

        if !ctx.dry_run {
            match self.fs.delete(path).await {
                Ok(true) => summary.deleted = true,
                Ok(false) => info!(file = %key, "Log file already removed"),
                Err(e) => ctx.record_error(ErrorCause::LogDeleteFailed, key, e.to_string()),
            }
        }

        ctx.progress(&format!(
            "{}: rows={} skipped={} filtered={} deleted={}",
            key, rows, skipped, filtered, summary.deleted
        ));
        Some(summary)
    }
}

fn default_node() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

impl std::fmt::Debug for LogDrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDrain")
            .field("config", &self.config)
            .field("mutex", &self.mutex)
            .field("ingestor", &self.ingestor)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}
