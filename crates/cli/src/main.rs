//! sift CLI
//!
//! Runs simulations and worker jobs against project directories and talks
//! to the task manager daemon.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{jobs, run};
use sift_lib::stopping::StoppingSpec;
use sift_lib::taskmanager::TaskClient;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Active-learning screening CLI
#[derive(Parser)]
#[command(name = "sift")]
#[command(author, version, about = "Active-learning screening with sift", long_about = None)]
pub struct Cli {
    /// Task manager address (can also be set via SIFT_MANAGER env var)
    #[arg(long, global = true, env = "SIFT_MANAGER", default_value = "127.0.0.1:5101")]
    pub manager: String,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate screening a fully labeled project
    Simulate {
        /// Project directory
        project_dir: PathBuf,

        /// Stopping rule, e.g. `n_labeled:50` or `target_found+quantile:0.5`
        #[arg(long)]
        stopping: Option<StoppingSpec>,
    },

    /// Run one job and report the outcome to the task manager
    Worker {
        /// Project directory
        project_dir: PathBuf,

        /// Run a simulation instead of a single train+rank step
        #[arg(long)]
        simulation: bool,

        /// Project id reported to the task manager (defaults to the directory name)
        #[arg(long)]
        project_id: Option<String>,

        /// Launch id assigned by the task manager, echoed back in the report
        #[arg(long)]
        launch_id: Option<u64>,
    },

    /// Queue a job on the task manager
    Enqueue {
        /// Project id
        project_id: String,

        /// Queue a simulation instead of a train+rank step
        #[arg(long)]
        simulation: bool,
    },

    /// Show task manager worker slots and running jobs
    Status,

    /// Terminate all running workers; waiting jobs are kept
    Reset,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let client = TaskClient::new(cli.manager);

    match cli.command {
        Commands::Simulate {
            project_dir,
            stopping,
        } => run::simulate(&project_dir, stopping, cli.format),
        Commands::Worker {
            project_dir,
            simulation,
            project_id,
            launch_id,
        } => {
            run::worker(
                &client,
                &project_dir,
                project_id,
                launch_id,
                simulation,
                cli.format,
            )
            .await
        }
        Commands::Enqueue {
            project_id,
            simulation,
        } => jobs::enqueue(&client, &project_id, simulation, cli.format).await,
        Commands::Status => jobs::status(&client, cli.format).await,
        Commands::Reset => jobs::reset(&client, cli.format).await,
    }
}
