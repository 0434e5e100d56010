use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use stepq_core::StepqConfig;
use stepq_queue::{JobParams, Queue};
use stepq_worker::{
    health, install_shutdown_handler, CommandRunner, Interval, ProcessSpec, QueueReconciler,
    StateFile, WorkerError, WorkerExecutor, WorkerLoop,
};

#[derive(Parser, Debug)]
#[command(name = "stepq")]
#[command(version)]
#[command(about = "Dataset job queue and worker supervisor")]
#[command(propagate_version = true)]
struct Args {
    /// Path to stepq.toml (default: $STEPQ_CONFIG, then ~/.stepq/stepq.toml)
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise a worker loop and a health-check server
    Executor,

    /// Claim and run jobs, publishing progress in a state file
    WorkerLoop {
        /// Where to publish the worker state
        #[arg(long)]
        state_file: Option<PathBuf>,
    },

    /// Serve GET /healthcheck
    Health,

    /// Enqueue a job
    Add {
        #[arg(long = "type")]
        job_type: String,

        #[arg(long)]
        dataset: String,

        /// Dataset config name
        #[arg(long)]
        config: Option<String>,

        #[arg(long)]
        split: Option<String>,

        #[arg(long)]
        force: bool,
    },

    /// Print job counts by status as JSON
    Counts {
        #[arg(long = "type")]
        job_type: String,
    },

    /// Print started jobs without recent heartbeats as JSON
    Zombies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is reserved for command output and the worker-loop banner
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepq=info,stepq_worker=info,stepq_queue=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_file = args.config_file.as_deref();
    let config = StepqConfig::load(config_file.and_then(Path::to_str)).context("loading config")?;

    match args.command {
        Commands::Executor => run_executor(config, config_file).await,
        Commands::WorkerLoop { state_file } => run_worker_loop(config, state_file).await,
        Commands::Health => {
            let shutdown = install_shutdown_handler()?;
            health::serve(&config.health.host, config.health.port, shutdown).await?;
            Ok(())
        }
        Commands::Add {
            job_type,
            dataset,
            config: dataset_config,
            split,
            force,
        } => {
            let mut params = JobParams::new(dataset);
            params.config = dataset_config;
            params.split = split;
            open_queue(&config)?.add_job(&job_type, &params, force)?;
            info!(%job_type, dataset = %params.dataset, "job added");
            Ok(())
        }
        Commands::Counts { job_type } => {
            let counts = open_queue(&config)?.get_jobs_count_by_status(&job_type)?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Commands::Zombies => {
            let zombies =
                open_queue(&config)?.get_zombies(config.worker.max_seconds_without_heartbeat())?;
            println!("{}", serde_json::to_string_pretty(&zombies)?);
            Ok(())
        }
    }
}

async fn run_executor(config: StepqConfig, config_file: Option<&Path>) -> anyhow::Result<()> {
    let queue = Arc::new(open_queue(&config)?);
    let state_path = config.worker.resolved_state_file_path();

    // both subprocesses are this binary, run with the same config file
    let exe = std::env::current_exe().context("locating the stepq binary")?;
    let subcommand = |name: &str| {
        let spec = ProcessSpec::new(&exe);
        let spec = match config_file {
            Some(path) => spec.arg("--config-file").arg(path),
            None => spec,
        };
        spec.arg(name)
    };
    let worker = subcommand("worker-loop").arg("--state-file").arg(&state_path);
    let health = subcommand("health");

    let reconciler = Arc::new(QueueReconciler::new(Arc::clone(&queue)));
    let executor = Arc::new(WorkerExecutor::new(
        queue,
        reconciler,
        StateFile::new(&state_path),
        config.worker.clone(),
        config.health.clone(),
        worker,
        health,
    ));

    let shutdown = install_shutdown_handler()?;
    info!(state_file = %state_path.display(), "starting executor");
    let result = executor.run(shutdown).await;
    if let Err(e) = StateFile::new(&state_path).remove() {
        warn!(error = %e, "failed to remove worker state file");
    }

    match result {
        Ok(()) => Ok(()),
        // exit with the worker's status so the process manager sees the cause
        Err(WorkerError::WorkerCrashed { exit, .. }) => std::process::exit(exit.exit_code().max(1)),
        Err(e) => Err(e.into()),
    }
}

async fn run_worker_loop(config: StepqConfig, state_file: Option<PathBuf>) -> anyhow::Result<()> {
    let command = config
        .worker
        .command
        .clone()
        .context("worker.command must be set to run the worker loop")?;
    let state_path = state_file.unwrap_or_else(|| config.worker.resolved_state_file_path());

    let worker = WorkerLoop::new(
        Arc::new(open_queue(&config)?),
        Arc::new(CommandRunner::new(command)),
        StateFile::new(&state_path),
        config.worker.job_types.clone(),
        config.queue.max_jobs_per_namespace,
        Interval::around(Duration::from_secs(config.worker.sleep_seconds)),
    );
    let shutdown = install_shutdown_handler()?;
    worker.publish_idle()?;

    // readiness banner awaited by the executor
    println!("{}", state_path.display());

    worker.run(shutdown).await?;
    Ok(())
}

fn open_queue(config: &StepqConfig) -> anyhow::Result<Queue> {
    let db_path = Path::new(&config.database.path);
    ensure_parent_dir(db_path);
    info!(path = %db_path.display(), "opening SQLite database");
    let busy_timeout = Duration::from_millis(config.database.busy_timeout_ms);
    Queue::open(db_path, busy_timeout).with_context(|| format!("opening {}", db_path.display()))
}

/// Create the parent directory of `path` if it does not exist yet.
fn ensure_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
