//! leasehold CLI
//!
//! - `run`: coordinator を起動し、タスクを投入して全て終端状態になるまで待つ
//! - `status`: 既存の SQLite ストアの件数と最新タスクを表示

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use leasehold_core::impls::{FlakyExecutor, InMemoryTaskStore, SimulatedExecutor, SqliteTaskStore, TracingSink};
use leasehold_core::ports::{ListOrder, TaskExecutor, TaskStore};
use leasehold_core::{CoordinatorBuilder, NewTask};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use settings::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lease-based distributed task scheduler", long_about = None)]
struct Cli {
    /// Config file (TOML, YAML or JSON). Defaults to ./leasehold.* if present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a coordinator, submit tasks, and wait for them to finish.
    Run(RunArgs),
    /// Print task counts for an existing SQLite store.
    Status {
        /// `sqlite://...` URL (overrides config).
        #[arg(long)]
        database: Option<String>,

        /// How many of the newest tasks to show.
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// `sqlite://...` URL (overrides config). In-memory when neither is set.
    #[arg(long)]
    database: Option<String>,

    /// JSON array of `{id, duration_ms, dependencies}`.
    #[arg(long, conflicts_with = "generate")]
    tasks: Option<PathBuf>,

    /// Submit N synthetic tasks, every fifth depending on the one before.
    #[arg(long)]
    generate: Option<usize>,

    /// Probability in [0, 1] that an attempt fails.
    #[arg(long, default_value_t = 0.0)]
    fail_rate: f64,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    match cli.command {
        Command::Run(args) => run(settings, args).await,
        Command::Status { database, recent } => status(settings, database, recent).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(settings: Settings, args: RunArgs) -> Result<()> {
    let mut config = settings.scheduler;
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    if !(0.0..=1.0).contains(&args.fail_rate) {
        bail!("--fail-rate must be between 0 and 1, got {}", args.fail_rate);
    }

    let tasks = match (&args.tasks, args.generate) {
        (Some(path), _) => read_tasks(path)?,
        (None, Some(n)) => generate_tasks(n),
        (None, None) => bail!("nothing to run: pass --tasks FILE or --generate N"),
    };

    let store = open_store(args.database.or(settings.database_url).as_deref()).await?;
    let executor: Arc<dyn TaskExecutor> = if args.fail_rate > 0.0 {
        Arc::new(FlakyExecutor::new(SimulatedExecutor, args.fail_rate))
    } else {
        Arc::new(SimulatedExecutor)
    };

    let coordinator = CoordinatorBuilder::new(store)
        .shared_executor(executor)
        .sink(TracingSink)
        .config(config)
        .build()
        .context("invalid scheduler configuration")?;

    let submitted = coordinator.submit_all(tasks).await.context("failed to submit tasks")?;
    info!(tasks = submitted.len(), "tasks submitted");

    coordinator.start().await?;
    let timeout = Duration::from_secs(args.timeout_secs);
    let settled = tokio::select! {
        settled = coordinator.wait_until_settled(Duration::from_millis(200), timeout) => settled?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down");
            false
        }
    };
    if !settled {
        warn!("stopping before every task reached a terminal state");
    }

    let stats = coordinator.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    coordinator.stop().await?;
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    counts: leasehold_core::ports::StatusCounts,
    recent: Vec<leasehold_core::Task>,
}

async fn status(settings: Settings, database: Option<String>, recent: usize) -> Result<()> {
    let Some(url) = database.or(settings.database_url) else {
        bail!("status needs a SQLite store: pass --database or set LEASEHOLD_DATABASE_URL");
    };
    let store = SqliteTaskStore::connect(&url)
        .await
        .with_context(|| format!("failed to open {url}"))?;
    let report = StatusReport {
        counts: store.counts_by_status().await?,
        recent: store.list(ListOrder::CreatedDesc, recent).await?,
    };
    store.close().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn open_store(url: Option<&str>) -> Result<Arc<dyn TaskStore>> {
    match url {
        Some(url) => {
            let store = SqliteTaskStore::connect(url)
                .await
                .with_context(|| format!("failed to open {url}"))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryTaskStore::new())),
    }
}

fn read_tasks(path: &Path) -> Result<Vec<NewTask>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn generate_tasks(n: usize) -> Vec<NewTask> {
    (0..n)
        .map(|i| {
            let duration = Duration::from_millis(50 + (i as u64 % 5) * 50);
            let task = NewTask::new(format!("task-{i:04}"), duration);
            if i % 5 == 4 {
                task.depends_on(format!("task-{:04}", i - 1))
            } else {
                task
            }
        })
        .collect()
}
