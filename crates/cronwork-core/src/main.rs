// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cronwork - time-boxed maintenance jobs
//!
//! Meant to be started by cron. Each invocation runs the requested jobs
//! within one wall-clock budget, prints the report as JSON and exits
//! non-zero when anything needs attention.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use cronwork_core::budget::TimeBudget;
use cronwork_core::config::{Config, JobParams};
use cronwork_core::fanout::TracingDigestSink;
use cronwork_core::mutex::LockFileMutex;
use cronwork_core::registry::{JobDeps, JobKind, build_job};
use cronwork_core::runtime::{JobContext, JobRuntime};
use cronwork_store::{SqliteStore, Store, migrations};

#[derive(Parser, Debug)]
#[command(name = "cronwork", version, about = "Time-boxed archive, log drain and report jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run jobs in order against one time budget.
    Run(RunArgs),
    /// List job types.
    Jobs,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job tags, e.g. `archive-clean log-drain`.
    #[arg(required = true)]
    jobs: Vec<JobKind>,

    /// JSON job parameters.
    #[arg(long, short)]
    params: Option<PathBuf>,

    /// Override CRONWORK_MAX_RUNTIME_SECS.
    #[arg(long, value_name = "SECS")]
    max_runtime: Option<u64>,

    /// Select but never write.
    #[arg(long)]
    dry_run: bool,

    /// Stop every job after one pass.
    #[arg(long)]
    single_pass: bool,

    /// Per-table and per-file progress.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Command::Run(args) if args.verbose);
    let default_filter = if verbose {
        "cronwork_core=debug,cronwork_store=debug"
    } else {
        "cronwork_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Jobs => {
            for kind in JobKind::ALL {
                println!("{}", kind);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    let params = match &args.params {
        Some(path) => JobParams::from_file(path)?,
        None => JobParams::default(),
    };

    let max_runtime = args
        .max_runtime
        .map(Duration::from_secs)
        .unwrap_or(config.max_runtime);
    let budget = TimeBudget::new(max_runtime);

    info!(
        jobs = ?args.jobs,
        max_runtime_secs = max_runtime.as_secs(),
        lock_dir = %config.lock_dir.display(),
        "Starting cronwork"
    );

    let mut stores = StoreCache::default();
    let logs = stores.open(&config.log_database_url, true).await?;
    let primary = stores.open(&config.primary_database_url, false).await?;
    let secondary = stores.open(&config.secondary_database_url, false).await?;

    let deps = JobDeps {
        primary,
        secondary,
        logs,
        lock: Arc::new(
            LockFileMutex::new(&config.lock_dir).with_stale_after(config.lock_stale_after),
        ),
        sink: Arc::new(TracingDigestSink),
    };

    let mut jobs: Vec<_> = args
        .jobs
        .iter()
        .map(|kind| build_job(*kind, &params, &deps))
        .collect();

    let ctx = JobContext::new(budget)
        .with_dry_run(args.dry_run || config.dry_run)
        .with_single_pass(args.single_pass)
        .with_verbose(args.verbose);
    let report = JobRuntime::new().execute_all(&mut jobs, ctx).await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.has_errors() {
        warn!(errors = report.errors.len(), "Finished with errors");
        Ok(ExitCode::FAILURE)
    } else {
        info!("Finished");
        Ok(ExitCode::SUCCESS)
    }
}

/// One pool per distinct database URL.
#[derive(Default)]
struct StoreCache {
    stores: HashMap<String, Arc<SqliteStore>>,
}

impl StoreCache {
    async fn open(&mut self, url: &str, migrate: bool) -> anyhow::Result<Arc<dyn Store>> {
        let store = match self.stores.get(url) {
            Some(store) => Arc::clone(store),
            None => {
                let store = Arc::new(SqliteStore::connect(url).await?);
                info!(url = %url, "Connected to database");
                self.stores.insert(url.to_string(), Arc::clone(&store));
                store
            }
        };
        if migrate {
            migrations::run_sqlite(store.pool()).await?;
            info!("Database schema verified");
        }
        Ok(store)
    }
}
