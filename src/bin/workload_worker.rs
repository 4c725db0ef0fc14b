//! # Workload Worker
//!
//! Binary wiring the queue consumer, task executor and workload controller
//! against Kubernetes, PostgreSQL, pgmq and the status sync service.
//!
//! ## Usage
//!
//! ```bash
//! workload-worker --config-dir config --environment production
//! WORKER_ENV=test workload-worker
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use workload_worker::config::ConfigManager;
use workload_worker::controller::WorkloadController;
use workload_worker::database::{DatabaseConnection, PgWorkloadStore};
use workload_worker::execution::TaskExecutor;
use workload_worker::logging;
use workload_worker::messaging::{ExecutorDispatcher, PgmqQueueClient, TaskQueueConsumer};
use workload_worker::orchestrator::KubeOrchestrator;
use workload_worker::status::HttpStatusClient;

#[derive(Parser)]
#[command(name = "workload-worker")]
#[command(about = "Consume service lifecycle tasks and drive Kubernetes workloads")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Directory holding worker-config.yaml
    #[arg(short, long, env = "WORKER_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Environment section to merge (development, test, production)
    #[arg(short, long)]
    environment: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_structured_logging();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting workload worker");

    let environment = cli
        .environment
        .unwrap_or_else(ConfigManager::detect_environment);
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir, &environment)
        .context("failed to load configuration")?;
    let config = manager.config();

    let orchestrator = KubeOrchestrator::from_config(&config.kubernetes)
        .await
        .context("failed to build kubernetes client")?;
    let database = DatabaseConnection::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    let store = PgWorkloadStore::new(database.pool().clone());
    let status = HttpStatusClient::new(&config.status).context("failed to build status client")?;

    let queue = PgmqQueueClient::new_with_pool(
        database.pool().clone(),
        config.queue.poll_interval(),
        config.queue.visibility_timeout_seconds,
    )
    .await;
    queue
        .create_queue(&config.queue.topic)
        .await
        .context("failed to create task queue")?;

    let controller = Arc::new(WorkloadController::new(
        Arc::new(orchestrator),
        Arc::new(store),
        Arc::new(status),
        config,
    ));

    match controller.sync_records().await {
        Ok(report) => info!(
            checked = report.checked,
            purged = report.purged,
            "Workload records synchronized"
        ),
        Err(e) => warn!(error = %e, "Workload record sync failed, continuing"),
    }

    let executor = TaskExecutor::new(&config.executor);
    let dispatcher = ExecutorDispatcher::new(executor.clone(), controller.clone());
    let consumer = Arc::new(TaskQueueConsumer::new(
        Arc::new(queue),
        Arc::new(dispatcher),
        config.queue.clone(),
    ));
    let consumer_handle = consumer.clone().start();

    info!(
        environment = %manager.environment(),
        topic = %config.queue.topic,
        "Workload worker started, press Ctrl+C to shut down"
    );

    shutdown_signal().await?;
    info!("Shutdown signal received");

    consumer.stop();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "Task queue consumer did not exit cleanly");
    }
    executor.stop().await;
    database.close().await;

    info!("Workload worker shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    Ok(())
}
