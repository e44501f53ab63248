// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job registry: the closed set of job types and how each is built.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use cronwork_store::Store;

use crate::archive::ArchiveCleanJob;
use crate::config::JobParams;
use crate::error::Error;
use crate::fanout::{DigestSink, ReportFanoutJob};
use crate::logs::{LogDrain, LogDrainJob, LogIngestor};
use crate::mutex::{AdvisoryLock, FileMutex};
use crate::queue::{IngestHandler, QueueConsumerJob, StoreQueue};
use crate::runtime::Job;

/// Job types, addressed by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// `archive-clean`
    ArchiveClean,
    /// `log-drain`
    LogDrain,
    /// `report-fanout`
    ReportFanout,
    /// `queue-consumer`
    QueueConsumer,
}

impl JobKind {
    /// Every job type.
    pub const ALL: [JobKind; 4] = [
        Self::ArchiveClean,
        Self::LogDrain,
        Self::ReportFanout,
        Self::QueueConsumer,
    ];

    /// Tag used on the command line and in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArchiveClean => ArchiveCleanJob::ID,
            Self::LogDrain => LogDrainJob::ID,
            Self::ReportFanout => ReportFanoutJob::ID,
            Self::QueueConsumer => QueueConsumerJob::ID,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownJob(s.to_string()))
    }
}

/// Collaborators the jobs are built from.
#[derive(Clone)]
pub struct JobDeps {
    /// Store holding rows to archive and clean.
    pub primary: Arc<dyn Store>,
    /// Store receiving archived rows.
    pub secondary: Arc<dyn Store>,
    /// Store holding logs, rules, members, users and the queue.
    pub logs: Arc<dyn Store>,
    /// Advisory lock for log files.
    pub lock: Arc<dyn AdvisoryLock>,
    /// Receiver of fan-out digests.
    pub sink: Arc<dyn DigestSink>,
}

/// Build the job for `kind` from its parameter section.
pub fn build_job(kind: JobKind, params: &JobParams, deps: &JobDeps) -> Box<dyn Job> {
    match kind {
        JobKind::ArchiveClean => Box::new(ArchiveCleanJob::new(
            params.archive_clean.clone(),
            Arc::clone(&deps.primary),
            Arc::clone(&deps.secondary),
        )),
        JobKind::LogDrain => {
            let cfg = params.log_drain.clone();
            let ingestor =
                LogIngestor::new(Arc::clone(&deps.logs), cfg.log_table.clone(), cfg.chunk_size);
            let mutex = FileMutex::new(Arc::clone(&deps.lock), cfg.lock_timeout());
            let exit_when_idle = cfg.exit_when_idle;
            Box::new(LogDrainJob::new(
                LogDrain::new(cfg, mutex, ingestor),
                exit_when_idle,
            ))
        }
        JobKind::ReportFanout => Box::new(ReportFanoutJob::new(
            params.report_fanout.clone(),
            Arc::clone(&deps.logs),
            Arc::clone(&deps.sink),
        )),
        JobKind::QueueConsumer => {
            let cfg = params.queue_consumer.clone();
            let queue = StoreQueue::new(
                Arc::clone(&deps.logs),
                cfg.queue_table.clone(),
                cfg.topic.clone(),
                cfg.poll_interval(),
            );
            let ingestor = LogIngestor::new(
                Arc::clone(&deps.logs),
                cfg.log_table.clone(),
                params.log_drain.chunk_size,
            );
            let node = params
                .log_drain
                .node
                .clone()
                .unwrap_or_else(|| QueueConsumerJob::ID.to_string());
            Box::new(QueueConsumerJob::new(
                cfg,
                Arc::new(queue),
                Arc::new(IngestHandler::new(ingestor, node)),
            ))
        }
    }
}
