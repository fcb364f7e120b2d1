//! Daemon configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use sift_lib::taskmanager::TaskManagerConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, from an optional file overlaid with `SIFT_*`
/// environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct TaskdConfig {
    /// Address of the task manager socket
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Accept timeout of the scheduling loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Grace period between SIGTERM and kill for running workers
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// SQLite file holding the waiting queue
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,

    /// Directory containing one subdirectory per project id
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,

    /// Executable started for each job, invoked as `<program> worker ...`
    #[serde(default = "default_worker_program")]
    pub worker_program: PathBuf,
}

fn default_bind_addr() -> String {
    "127.0.0.1:5101".to_string()
}

fn default_api_port() -> u16 {
    9101
}

fn default_max_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("sift-queue.db")
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("projects")
}

fn default_worker_program() -> PathBuf {
    PathBuf::from("sift")
}

impl Default for TaskdConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_port: default_api_port(),
            max_workers: default_max_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            queue_path: default_queue_path(),
            projects_root: default_projects_root(),
            worker_program: default_worker_program(),
        }
    }
}

impl TaskdConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("SIFT").try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let parsed: TaskdConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_workers > 0, "max_workers must be at least 1");
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        Ok(())
    }

    pub fn manager_config(&self) -> TaskManagerConfig {
        TaskManagerConfig {
            bind_addr: self.bind_addr.clone(),
            max_workers: self.max_workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}
