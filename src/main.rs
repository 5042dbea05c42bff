//! DWG Converter Service
//!
//! One binary, several roles:
//!
//! - `serve`: REST job coordinator
//! - `worker`: worker pool consuming the broker queue
//! - `standalone`: both of the above in one process
//! - `convert` / `cleanup`: one-shot local operations
//!
//! ## Configuration
//!
//! Environment variables (see `config`), most notably:
//! - `BROKER_URL`: Redis connection string, or `memory://` (default: redis://127.0.0.1:6379/0)
//! - `PORT`: API port (default: 5000)
//! - `WORKER_CONCURRENCY`: Number of concurrent conversions (default: 4)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dwg_converter::api::{self, AppState};
use dwg_converter::broker::{Broker, MemoryBroker};
use dwg_converter::config::{Config, WorkerConfig};
use dwg_converter::converter::{Converter, DrawingConverter};
use dwg_converter::executor::{serve_child, Executor, ProcessExecutor};
use dwg_converter::housekeeping;
use dwg_converter::job::ConversionResult;
use dwg_converter::queue::RedisBroker;
use dwg_converter::telemetry;
use dwg_converter::worker::{ExecutorFactory, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dwg-converter", version, about = "CAD drawing to PDF conversion service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST job coordinator
    Serve,
    /// Run a worker pool
    Worker,
    /// Run the coordinator and a worker pool in one process
    Standalone,
    /// Convert a single drawing to PDF
    Convert {
        input: PathBuf,
        output: PathBuf,
    },
    /// Delete stale files from a directory
    Cleanup {
        directory: PathBuf,
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
    /// Conversion child process (internal)
    #[command(hide = true)]
    Child,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(telemetry::init_logging);

    match cli.command {
        Command::Child => serve_child(&DrawingConverter::from_env()),
        Command::Convert { input, output } => convert_once(input, output),
        Command::Cleanup {
            directory,
            max_age_hours,
        } => {
            let deleted = housekeeping::cleanup(&directory, max_age_hours)
                .with_context(|| format!("Cleanup of {} failed", directory.display()))?;
            println!("{}", serde_json::json!({ "deleted_count": deleted }));
            Ok(())
        }
        role => {
            if std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
                if let Err(e) = telemetry::init_telemetry() {
                    warn!("Failed to initialize telemetry: {}", e);
                }
            }
            let result = run_service(role, config).await;
            telemetry::shutdown_telemetry();
            result
        }
    }
}

async fn run_service(role: Command, config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let standalone = matches!(role, Command::Standalone);
    let broker = connect_broker(&config, standalone).await?;

    match role {
        Command::Serve => {
            info!("Starting job coordinator");
            api::serve(&config.api, api_state(&config, broker), shutdown).await
        }
        Command::Worker => {
            info!("Starting conversion worker");
            spawn_housekeeping(&config, shutdown.clone());
            worker_pool(&config.worker, broker)?.run(shutdown).await
        }
        _ => {
            info!("Starting standalone service");
            spawn_housekeeping(&config, shutdown.clone());
            let pool = worker_pool(&config.worker, broker.clone())?;
            let (api_result, worker_result) = tokio::join!(
                api::serve(&config.api, api_state(&config, broker), shutdown.clone()),
                pool.run(shutdown.clone()),
            );
            api_result.and(worker_result)
        }
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, finishing running jobs..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });
}

async fn connect_broker(config: &Config, standalone: bool) -> Result<Arc<dyn Broker>> {
    if config.uses_memory_broker() {
        if !standalone {
            warn!("memory:// broker is private to this process, jobs are not shared");
        }
        return Ok(Arc::new(MemoryBroker::with_result_ttl(config.result_ttl)));
    }

    let broker = RedisBroker::connect(&config.broker_url, config.result_ttl)
        .await
        .context("Failed to connect to broker")?;
    info!("Connected to Redis");
    Ok(Arc::new(broker))
}

fn api_state(config: &Config, broker: Arc<dyn Broker>) -> AppState {
    AppState::new(broker, config.api.max_content_length)
}

fn worker_pool(config: &WorkerConfig, broker: Arc<dyn Broker>) -> Result<WorkerPool> {
    let program = std::env::current_exe().context("Failed to locate own executable")?;
    let max_tasks_per_child = config.max_tasks_per_child;
    let factory: ExecutorFactory = Arc::new(move || {
        Box::new(ProcessExecutor::new(program.clone(), max_tasks_per_child)) as Box<dyn Executor>
    });

    info!(
        "Configuration: worker={}, concurrency={}, soft_limit={}s, hard_limit={}s, max_tasks_per_child={}",
        config.name,
        config.concurrency,
        config.soft_time_limit.as_secs(),
        config.hard_time_limit.as_secs(),
        max_tasks_per_child
    );
    Ok(WorkerPool::new(broker, config.clone(), factory))
}

fn spawn_housekeeping(config: &Config, shutdown: CancellationToken) {
    if let Some(dir) = config.cleanup.dir.clone() {
        tokio::spawn(housekeeping::run_periodic(
            dir,
            config.cleanup.max_age_hours,
            config.cleanup.interval,
            shutdown,
        ));
    }
}

fn convert_once(input: PathBuf, output: PathBuf) -> Result<()> {
    let started = Instant::now();
    let outcome = DrawingConverter::from_env().convert(&input, &output);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let result = match &outcome {
        Ok(()) => ConversionResult::succeeded(output.to_string_lossy(), elapsed_ms),
        Err(e) => ConversionResult::failed(e.to_string(), elapsed_ms),
    };
    println!("{}", serde_json::to_string_pretty(&result)?);

    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
