// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job lifecycle driver.
//!
//! A job is a `before / run / after` triple. [`JobRuntime`] calls `before`
//! once, calls `run` until it reports `exit` or the shared [`TimeBudget`]
//! runs out, then calls `after` once no matter how the loop ended. Each
//! `run` call is a complete, bounded unit of work; nothing is preempted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::budget::TimeBudget;
use crate::error::{ErrorCause, ErrorMap, Result};

/// State shared by every phase of a job: the budget, the error map and the
/// run flags. Job-specific state lives in the job itself.
#[derive(Debug)]
pub struct JobContext {
    /// Wall-clock budget for the whole invocation.
    pub budget: TimeBudget,
    /// Accumulated errors, reported after the run.
    pub errors: ErrorMap,
    /// Read but never write.
    pub dry_run: bool,
    /// Stop after one pass regardless of outcome.
    pub single_pass: bool,
    /// Emit per-table and per-file progress at info level.
    pub verbose: bool,
}

impl JobContext {
    /// Context with no flags set.
    pub fn new(budget: TimeBudget) -> Self {
        Self {
            budget,
            errors: ErrorMap::new(),
            dry_run: false,
            single_pass: false,
            verbose: false,
        }
    }

    /// Set the dry-run flag.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the single-pass flag.
    pub fn with_single_pass(mut self, single_pass: bool) -> Self {
        self.single_pass = single_pass;
        self
    }

    /// Set the verbose flag.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Record an error and log it.
    pub fn record_error(&mut self, cause: ErrorCause, id: &str, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(cause = cause.as_str(), id = %id, detail = %detail, "Job error recorded");
        self.errors.record(cause, id, detail);
    }

    /// Progress line: info when verbose, debug otherwise.
    pub fn progress(&self, message: &str) {
        if self.verbose {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }
}

/// What one `run` call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Stop calling `run`.
    pub exit: bool,
    /// Pass result, handed to `after` when it is the last one.
    pub result: Value,
}

impl StepOutcome {
    /// More work remains.
    pub fn proceed(result: Value) -> Self {
        Self {
            exit: false,
            result,
        }
    }

    /// The job is done.
    pub fn exit(result: Value) -> Self {
        Self { exit: true, result }
    }
}

/// A runnable job.
#[async_trait]
pub trait Job: Send {
    /// Identifier used in the result and error maps.
    fn id(&self) -> &str;

    /// One-time setup. Must not consume meaningful runtime.
    async fn before(&mut self, _ctx: &mut JobContext) -> Result<()> {
        Ok(())
    }

    /// One bounded unit of work.
    async fn run(&mut self, ctx: &mut JobContext) -> Result<StepOutcome>;

    /// Translate bookkeeping into the reported result. Always called once.
    async fn after(&mut self, _ctx: &mut JobContext, last: Option<Value>) -> Value {
        last.unwrap_or(Value::Null)
    }
}

/// Final shape of an invocation:
/// `{result: {job: {sub_job: summary}}, errors: {cause: {job: detail}}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobReport {
    /// Per-job results.
    pub result: BTreeMap<String, Value>,
    /// Errors partitioned by cause.
    pub errors: ErrorMap,
}

impl JobReport {
    /// Whether the run needs operator attention.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Runs jobs against one shared budget and error map.
#[derive(Debug, Default)]
pub struct JobRuntime;

impl JobRuntime {
    /// Create a runtime.
    pub fn new() -> Self {
        Self
    }

    /// Run one job.
    pub async fn execute(&self, job: &mut dyn Job, ctx: JobContext) -> JobReport {
        let mut ctx = ctx;
        let mut report = JobReport::default();
        self.execute_into(job, &mut ctx, &mut report).await;
        report.errors = ctx.errors;
        report
    }

    /// Run jobs in order. Later jobs get whatever budget the earlier ones
    /// left; a job that starts with no budget left still runs `before` and
    /// `after`.
    pub async fn execute_all(&self, jobs: &mut [Box<dyn Job>], ctx: JobContext) -> JobReport {
        let mut ctx = ctx;
        let mut report = JobReport::default();
        for job in jobs.iter_mut() {
            self.execute_into(job.as_mut(), &mut ctx, &mut report).await;
        }
        report.errors = ctx.errors;
        report
    }

    async fn execute_into(&self, job: &mut dyn Job, ctx: &mut JobContext, report: &mut JobReport) {
        let job_id = job.id().to_string();
        let run_id = Uuid::new_v4();
        let span = info_span!("job", job = %job_id, run_id = %run_id);

        let result = lifecycle(job, ctx, &job_id).instrument(span).await;
        report.result.insert(job_id, result);
    }
}

async fn lifecycle(job: &mut dyn Job, ctx: &mut JobContext, job_id: &str) -> Value {
    let mut last = None;
    let mut passes = 0u64;

    info!(remaining_secs = ctx.budget.remaining_secs(), "Job starting");

    match job.before(ctx).await {
        Ok(()) => loop {
            if ctx.budget.is_exhausted() {
                info!(passes, "Time budget exhausted");
                break;
            }
            passes += 1;
            match job.run(ctx).await {
                Ok(step) => {
                    last = Some(step.result);
                    if step.exit {
                        debug!(passes, "Job signalled exit");
                        break;
                    }
                    if ctx.single_pass {
                        break;
                    }
                }
                Err(e) => {
                    ctx.record_error(ErrorCause::JobFailed, job_id, e.to_string());
                    break;
                }
            }
        },
        Err(e) => ctx.record_error(ErrorCause::JobFailed, job_id, e.to_string()),
    }

    let result = job.after(ctx, last).await;
    info!(
        passes,
        elapsed_ms = ctx.budget.elapsed().as_millis() as u64,
        errors = ctx.errors.len(),
        "Job finished"
    );
    result
}
