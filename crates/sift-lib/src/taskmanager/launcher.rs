//! Worker process launching and supervision

use super::protocol::validate_project_id;
use super::queue::QueueEntry;
use crate::error::{Result, SiftError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// A running worker
#[async_trait]
pub trait WorkerHandle: Send {
    /// `Some(success)` once the worker has exited
    fn try_wait(&mut self) -> Result<Option<bool>>;

    /// Ask the worker to stop, force it after `grace`
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

pub trait WorkerLauncher: Send {
    /// Start a worker for `job`. The worker tags its report with `launch_id`.
    fn launch(&mut self, job: &QueueEntry, launch_id: u64) -> Result<Box<dyn WorkerHandle>>;
}

/// Spawns `<program> worker <projects_root>/<id> --project-id <id> --launch-id <n>
/// --manager <addr> [--simulation]`
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    projects_root: PathBuf,
    manager_addr: String,
}

impl ProcessLauncher {
    pub fn new(
        program: impl Into<PathBuf>,
        projects_root: impl Into<PathBuf>,
        manager_addr: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            projects_root: projects_root.into(),
            manager_addr: manager_addr.into(),
        }
    }

    fn command(&self, job: &QueueEntry, launch_id: u64) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg(self.projects_root.join(&job.project_id))
            .arg("--project-id")
            .arg(&job.project_id)
            .arg("--launch-id")
            .arg(launch_id.to_string())
            .arg("--manager")
            .arg(&self.manager_addr)
            .stdin(Stdio::null());
        if job.simulation {
            cmd.arg("--simulation");
        }
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, job: &QueueEntry, launch_id: u64) -> Result<Box<dyn WorkerHandle>> {
        validate_project_id(&job.project_id)?;
        let child = self.command(job, launch_id).spawn().map_err(|e| {
            SiftError::Scheduling(format!(
                "failed to spawn worker {} for {}: {}",
                self.program.display(),
                job.project_id,
                e
            ))
        })?;
        debug!(project_id = %job.project_id, launch_id, pid = ?child.id(), "Spawned worker");
        Ok(Box::new(ProcessHandle { child }))
    }
}

pub struct ProcessHandle {
    child: Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn try_wait(&mut self) -> Result<Option<bool>> {
        Ok(self.child.try_wait()?.map(|status| status.success()))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        send_sigterm(&self.child);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(status = ?status, "Worker exited after SIGTERM");
            }
            Err(_) => {
                warn!(pid = ?self.child.id(), "Worker ignored SIGTERM, killing");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "Failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(simulation: bool) -> QueueEntry {
        entry("p-7", simulation)
    }

    fn entry(project_id: &str, simulation: bool) -> QueueEntry {
        QueueEntry {
            project_id: project_id.to_string(),
            simulation,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_command_line() {
        let launcher = ProcessLauncher::new("/usr/bin/sift", "/srv/projects", "127.0.0.1:5101");
        let cmd = launcher.command(&job(true), 12);
        let std_cmd = cmd.as_std();
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "worker",
                "/srv/projects/p-7",
                "--project-id",
                "p-7",
                "--launch-id",
                "12",
                "--manager",
                "127.0.0.1:5101",
                "--simulation"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_scheduling_error() {
        let mut launcher = ProcessLauncher::new("/nonexistent/sift-worker", "/tmp", "127.0.0.1:1");
        assert!(matches!(
            launcher.launch(&job(false), 1),
            Err(SiftError::Scheduling(_))
        ));
    }

    #[tokio::test]
    async fn test_refuses_project_outside_root() {
        let mut launcher = ProcessLauncher::new("sleep", "/srv/projects", "127.0.0.1:1");
        for id in ["/etc", "../../home/victim"] {
            assert!(matches!(
                launcher.launch(&entry(id, false), 1),
                Err(SiftError::Protocol(_))
            ));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_process() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut handle = ProcessHandle { child };
        assert_eq!(handle.try_wait().unwrap(), None);
        handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.try_wait().unwrap(), Some(false));
    }
}
