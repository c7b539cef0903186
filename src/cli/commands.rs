//! CLI command definitions for janitor.
//!
//! `serve` runs the whole pipeline in one process: the runner's dispatch
//! loop, the scheduler and publisher cycles and the HTTP API. The other
//! commands run a single step and exit.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::JanitorConfig;
use crate::metrics::init_metrics;
use crate::model::Candidate;
use crate::publisher::{CommandPublishAction, DryRunPublishAction, PublishAction, Publisher};
use crate::queue::{Queue, SqliteQueue};
use crate::runner::{RetryPolicy, Runner, RunnerSettings, SubprocessWorker};
use crate::scheduler::{Ranker, Scheduler};
use crate::storage::{Database, SqliteStore, StateStore};

/// Schedules, runs and publishes automated changes across many repositories.
#[derive(Parser)]
#[command(name = "janitor")]
#[command(about = "Schedule, run and publish automated source-control changes")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the YAML configuration file. A missing file means defaults.
    #[arg(
        short,
        long,
        default_value = "janitor.yaml",
        env = "JANITOR_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run dispatch, scheduling, publishing and the HTTP API until interrupted.
    Serve(ServeArgs),

    /// Run one scheduler cycle and exit.
    Schedule,

    /// Run one publisher cycle and exit.
    Publish,

    /// Load candidates from a YAML or JSON list.
    Import(ImportArgs),

    /// Apply the database schema.
    Migrate,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address for the HTTP API, overriding `listen_address`.
    #[arg(long)]
    pub listen: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ImportArgs {
    /// File with a list of candidates; `.json` is read as JSON, anything
    /// else as YAML.
    pub file: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse the CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = JanitorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve(args) => run_serve_command(config, args).await,
        Commands::Schedule => run_schedule_command(config).await,
        Commands::Publish => run_publish_command(config).await,
        Commands::Import(args) => run_import_command(config, args).await,
        Commands::Migrate => run_migrate_command(config).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Every component, wired to the same database.
struct Pipeline {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn Queue>,
    runner: Arc<Runner>,
    scheduler: Arc<Scheduler>,
    publisher: Arc<Publisher>,
}

async fn open_database(config: &JanitorConfig) -> anyhow::Result<Database> {
    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?;
    let applied = db.run_migrations().await?;
    if applied > 0 {
        info!(applied = applied, "Applied database migrations");
    }
    Ok(db)
}

async fn build_pipeline(config: &JanitorConfig) -> anyhow::Result<Pipeline> {
    let db = open_database(config).await?;
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::new(db.clone()));
    let queue: Arc<dyn Queue> = Arc::new(SqliteQueue::new(db, config.runner.one_run_per_target));

    let action: Arc<dyn PublishAction> = match &config.publisher.command {
        Some(command) => Arc::new(CommandPublishAction::new(
            command.clone(),
            Duration::from_secs(config.publisher.action_timeout_secs),
            config.publisher.dry_run,
        )?),
        None => {
            if !config.publisher.dry_run {
                warn!("No publisher.command configured, changes will only be logged");
            }
            Arc::new(DryRunPublishAction)
        }
    };
    let publisher = Arc::new(Publisher::new(&config.publisher, store.clone(), action));

    let ranker = Ranker::new(config.scheduler.clone(), publisher.limiter());
    let scheduler = Arc::new(Scheduler::new(
        ranker,
        Duration::from_secs(config.scheduler.interval_secs),
        store.clone(),
        queue.clone(),
    ));

    let mut runner = Runner::new(
        RunnerSettings::from_config(&config.runner),
        RetryPolicy::from_config(&config.retry),
        store.clone(),
        queue.clone(),
    );
    match &config.runner.worker_command {
        Some(command) => {
            let worker = SubprocessWorker::new(
                config.runner.worker_name.clone(),
                command.clone(),
                config.runner.max_concurrency,
            )?
            .with_suites(config.runner.worker_suites.clone());
            runner = runner.with_worker(Arc::new(worker));
        }
        None => info!("No runner.worker_command configured, waiting for remote workers"),
    }

    Ok(Pipeline {
        store,
        queue,
        runner: Arc::new(runner),
        scheduler,
        publisher,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_serve_command(config: JanitorConfig, args: ServeArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to register metrics")?;

    let listen = args.listen.unwrap_or_else(|| config.listen_address.clone());
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address: {}", listen))?;

    let pipeline = build_pipeline(&config).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let runner = pipeline.runner.clone();
    let runner_shutdown = shutdown_tx.subscribe();
    let runner_task = tokio::spawn(async move { runner.dispatch_loop(runner_shutdown).await });

    let scheduler = pipeline.scheduler.clone();
    let scheduler_shutdown = shutdown_tx.subscribe();
    let scheduler_task =
        tokio::spawn(async move { scheduler.run_loop(scheduler_shutdown).await });

    let publisher = pipeline.publisher.clone();
    let publisher_shutdown = shutdown_tx.subscribe();
    let finished = pipeline.runner.subscribe();
    let publisher_task =
        tokio::spawn(async move { publisher.run_loop(publisher_shutdown, finished).await });

    let state = AppState {
        store: pipeline.store.clone(),
        queue: pipeline.queue.clone(),
        runner: pipeline.runner.clone(),
        scheduler: pipeline.scheduler.clone(),
        publisher: pipeline.publisher.clone(),
    };
    let api_task = tokio::spawn(api::serve(state, addr, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());

    let finished =
        futures::future::join_all([runner_task, scheduler_task, publisher_task]).await;
    for result in finished {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    api_task.await??;

    Ok(())
}

async fn run_schedule_command(config: JanitorConfig) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config).await?;
    let report = pipeline.scheduler.run_once().await?;
    print_json(&report)
}

async fn run_publish_command(config: JanitorConfig) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config).await?;
    let report = pipeline.publisher.run_cycle().await?;
    print_json(&report)
}

#[derive(Debug, Serialize)]
struct ImportOutput {
    file: String,
    candidates: usize,
}

fn load_candidates(path: &Path) -> anyhow::Result<Vec<Candidate>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let candidates = if is_json {
        serde_json::from_str(&raw)?
    } else {
        serde_yaml::from_str(&raw)?
    };
    Ok(candidates)
}

async fn run_import_command(config: JanitorConfig, args: ImportArgs) -> anyhow::Result<()> {
    let candidates = load_candidates(&args.file)?;
    let db = open_database(&config).await?;
    let store = SqliteStore::new(db);
    let written = store.upsert_candidates(&candidates).await?;

    info!(file = %args.file.display(), candidates = written, "Imported candidates");
    print_json(&ImportOutput {
        file: args.file.display().to_string(),
        candidates: written,
    })
}

async fn run_migrate_command(config: JanitorConfig) -> anyhow::Result<()> {
    let db = Database::connect(&config.database_url).await?;
    let applied = db.run_migrations().await?;
    println!("Applied {} migration(s) to {}", applied, config.database_url);
    Ok(())
}
