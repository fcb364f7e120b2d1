//! sift-taskd - task manager daemon
//!
//! Accepts job messages on a TCP socket, keeps waiting jobs in a durable
//! queue and runs up to `max_workers` worker processes at a time.

use anyhow::{Context, Result};
use clap::Parser;
use sift_lib::{
    health::{components, HealthRegistry},
    observability::SiftMetrics,
    taskmanager::{ProcessLauncher, TaskManager, WaitingQueue},
};
use sift_taskd::{api, config::TaskdConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sift-taskd", version, about = "Task manager daemon for sift")]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(long, env = "SIFT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = TaskdConfig::load(args.config.as_deref())?;
    info!(
        bind_addr = %config.bind_addr,
        max_workers = config.max_workers,
        projects_root = %config.projects_root.display(),
        "Task manager configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::TASK_MANAGER).await;
    health_registry.register(components::QUEUE).await;
    health_registry.register(components::WORKERS).await;

    let metrics = SiftMetrics::new();
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let queue = WaitingQueue::open(&config.queue_path)
        .with_context(|| format!("Failed to open queue {}", config.queue_path.display()))?;
    let launcher = ProcessLauncher::new(
        &config.worker_program,
        &config.projects_root,
        config.bind_addr.clone(),
    );
    let mut manager = TaskManager::new(config.manager_config(), queue, Box::new(launcher))?
        .with_health(health_registry);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("SIGINT received"),
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
        let _ = shutdown_tx.send(());
    });

    let result = manager.run(shutdown_rx).await;
    api_handle.abort();
    result.context("Task manager stopped with an error")?;

    info!("Shutting down");
    Ok(())
}
