// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cronwork Core - Time-Boxed Job Runtime
//!
//! This crate runs maintenance jobs inside a fixed wall-clock budget, one
//! process per cron tick. Overlapping ticks are expected; the only
//! cross-process coordination is an advisory lock on each log file.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    JobRuntime (before / run / after)              │
//! │                 shared TimeBudget + ErrorMap (JobContext)         │
//! └───────────────────────────────────────────────────────────────────┘
//!        │                   │                  │                │
//!        ▼                   ▼                  ▼                ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐  ┌──────────────┐
//! │archive-clean │   │  log-drain   │   │report-fanout │  │queue-consumer│
//! │BatchJobDriver│   │  LogDrain    │   │ RuleMatcher  │  │ StoreQueue   │
//! │ StateMachine │   │  LogIngestor │   │ DigestSink   │  │IngestHandler │
//! └──────────────┘   └──────────────┘   └──────────────┘  └──────────────┘
//!    │        │         │        │          │                   │
//!    ▼        ▼         ▼        ▼          ▼                   ▼
//! primary secondary  log files  log store ◄─┴───────────────────┘
//!  store    store    + FileMutex
//! ```
//!
//! # Jobs
//!
//! | Tag | Description |
//! |-----|-------------|
//! | `archive-clean` | Copy expiring rows to the secondary store, then delete them from the primary |
//! | `log-drain` | Move rotated log files into the log store, one file per pass |
//! | `report-fanout` | Match recent logs against notification rules, build per-user digests |
//! | `queue-consumer` | Listen on a queue table and ingest each message as a log line |
//!
//! # Result Shape
//!
//! ```json
//! {
//!   "result": { "archive-clean": { "sessions": { "retries": 0, "successful_items": 1200, ... } } },
//!   "errors": { "clean_failed": { "orders": "Store error: ..." } }
//! }
//! ```
//!
//! Errors never abort a job. Every non-catastrophic fault is absorbed into
//! the job's state and the error map; `after` always runs.
//!
//! # Modules
//!
//! - [`budget`]: [`TimeBudget`]
//! - [`mutex`]: advisory locks and scoped claims
//! - [`runtime`]: the [`Job`] trait and [`JobRuntime`]
//! - [`archive`]: archive/clean state machine and driver
//! - [`logs`]: log drain and ingestor
//! - [`fanout`]: rule matching and digests
//! - [`queue`]: queue consumer
//! - [`registry`]: job tags and construction
//! - [`config`]: environment and JSON parameters
//! - [`error`]: error types and the error map

#![deny(missing_docs)]

/// Archive-then-clean of expiring rows.
pub mod archive;

/// Wall-clock budget.
pub mod budget;

/// Environment configuration and job parameters.
pub mod config;

/// Error types.
pub mod error;

/// Report fan-out.
pub mod fanout;

/// Log drain.
pub mod logs;

/// Advisory locks.
pub mod mutex;

/// Queue consumer.
pub mod queue;

/// Job registry.
pub mod registry;

/// Job lifecycle driver.
pub mod runtime;

pub use budget::TimeBudget;
pub use error::{Error, ErrorCause, ErrorMap, Result};
pub use registry::{JobKind, build_job};
pub use runtime::{Job, JobContext, JobReport, JobRuntime, StepOutcome};
