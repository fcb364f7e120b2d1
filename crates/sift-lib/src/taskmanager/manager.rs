//! Bounded-concurrency job scheduler
//!
//! The waiting queue is durable; the map of running jobs lives in memory only.
//! Each tick drains buffered messages, reaps workers that died without
//! reporting, then promotes waiting jobs oldest first into free slots.

use super::launcher::{WorkerHandle, WorkerLauncher};
use super::protocol::{validate_project_id, Message, MessageFramer, StatusReply};
use super::queue::WaitingQueue;
use crate::error::{Result, SiftError};
use crate::health::{components, HealthRegistry};
use crate::observability::{SiftMetrics, StructuredLogger};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Longest a single client connection may take to deliver its messages
const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub bind_addr: String,
    pub max_workers: usize,
    /// Accept timeout; one scheduling tick per interval at most
    pub poll_interval: Duration,
    /// Time between SIGTERM and kill when stopping workers
    pub shutdown_grace: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5101".to_string(),
            max_workers: 2,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

struct RunningJob {
    handle: Box<dyn WorkerHandle>,
    launch_id: u64,
    simulation: bool,
    started: Instant,
}

pub struct TaskManager {
    config: TaskManagerConfig,
    queue: WaitingQueue,
    launcher: Box<dyn WorkerLauncher>,
    pending: HashMap<String, RunningJob>,
    messages: VecDeque<Message>,
    next_launch_id: u64,
    health: Option<HealthRegistry>,
    metrics: SiftMetrics,
    logger: StructuredLogger,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        queue: WaitingQueue,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Result<Self> {
        if config.max_workers == 0 {
            return Err(SiftError::config("max_workers must be at least 1"));
        }
        Ok(Self {
            config,
            queue,
            launcher,
            pending: HashMap::new(),
            messages: VecDeque::new(),
            next_launch_id: 1,
            health: None,
            metrics: SiftMetrics::new(),
            logger: StructuredLogger::new("task_manager"),
        })
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn queue(&self) -> &WaitingQueue {
        &self.queue
    }

    /// Project ids with a running worker, sorted
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn status(&self) -> StatusReply {
        let running = self.pending.len();
        StatusReply {
            max_workers: self.config.max_workers,
            currently_running: running,
            available_slots: self.config.max_workers.saturating_sub(running),
            running_project_ids: self.pending_ids(),
        }
    }

    /// Buffer a message for the next tick. Status queries are answered on the
    /// connection and never buffered.
    pub fn submit(&mut self, message: Message) {
        if message != Message::StatusQuery {
            self.messages.push_back(message);
        }
    }

    /// One scheduling round
    pub async fn tick(&mut self) -> Result<()> {
        while let Some(message) = self.messages.pop_front() {
            if let Err(e) = self.handle_message(message).await {
                error!(error = %e, "Failed to apply message");
                report_queue_health(self.health.as_ref(), Err(&e)).await;
            }
        }
        self.reap_exited();
        let promoted = self.promote();
        report_queue_health(self.health.as_ref(), promoted.as_ref().map(|_| ())).await;

        let running = self.pending.len();
        let waiting = self.queue.len().unwrap_or(0);
        self.metrics.set_running_workers(running);
        self.metrics.set_waiting_jobs(waiting);
        if let Some(health) = &self.health {
            health
                .observe_worker_pool(running, self.config.max_workers, waiting)
                .await;
        }
        promoted.map(|_| ())
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Insert {
                project_id,
                simulation,
            } => {
                if let Err(e) = validate_project_id(&project_id) {
                    warn!(error = %e, "Dropping insert");
                    return Ok(());
                }
                if self.queue.insert(&project_id, simulation)? {
                    self.metrics.inc_jobs_enqueued();
                    self.logger.log_job_enqueued(&project_id, simulation);
                } else {
                    debug!(project_id = %project_id, "Job already waiting");
                }
            }
            Message::Remove {
                project_id,
                launch_id,
            } => match self.take_reported(&project_id, launch_id) {
                Some(job) => {
                    let secs = job.started.elapsed().as_secs_f64();
                    self.metrics.inc_jobs_completed();
                    self.metrics.observe_job_duration(secs);
                    self.logger.log_job_completed(&project_id, Some(secs));
                }
                None => warn!(project_id = %project_id, "Remove for a job that is not running"),
            },
            Message::Failure {
                project_id,
                launch_id,
            } => match self.take_reported(&project_id, launch_id) {
                Some(job) => {
                    self.metrics.inc_jobs_failed();
                    self.metrics
                        .observe_job_duration(job.started.elapsed().as_secs_f64());
                    self.logger.log_job_failed(&project_id, "worker reported failure");
                }
                None => warn!(project_id = %project_id, "Failure for a job that is not running"),
            },
            Message::ResetPending => self.reset_pending().await,
            Message::StatusQuery => {}
        }
        Ok(())
    }

    /// Stop tracking the job a worker report refers to. A report tagged with
    /// an older launch belongs to a worker that was already reaped and must
    /// not end the job that replaced it.
    fn take_reported(&mut self, project_id: &str, launch_id: Option<u64>) -> Option<RunningJob> {
        let current = self.pending.get(project_id)?.launch_id;
        match launch_id {
            Some(id) if id != current => {
                warn!(
                    project_id = %project_id,
                    launch_id = id,
                    current,
                    "Ignoring report from an earlier launch"
                );
                None
            }
            _ => self.pending.remove(project_id),
        }
    }

    /// Workers that exited unsuccessfully without reporting count as failed.
    /// A clean exit waits for its `remove` message.
    fn reap_exited(&mut self) {
        let mut failed = Vec::new();
        for (project_id, job) in self.pending.iter_mut() {
            match job.handle.try_wait() {
                Ok(Some(false)) => failed.push(project_id.clone()),
                Ok(_) => {}
                Err(e) => warn!(project_id = %project_id, error = %e, "Cannot poll worker"),
            }
        }
        for project_id in failed {
            self.pending.remove(&project_id);
            self.metrics.inc_jobs_failed();
            self.logger
                .log_job_failed(&project_id, "worker exited without reporting");
        }
    }

    /// Start waiting jobs while slots are free. The queue row is deleted only
    /// after the worker started, so a crash in between re-runs the job.
    fn promote(&mut self) -> Result<usize> {
        let mut available = self.config.max_workers.saturating_sub(self.pending.len());
        if available == 0 {
            return Ok(0);
        }

        let mut promoted = 0;
        for entry in self.queue.list()? {
            if available == 0 {
                break;
            }
            if self.pending.contains_key(&entry.project_id) {
                continue;
            }
            if let Err(e) = validate_project_id(&entry.project_id) {
                warn!(error = %e, "Discarding waiting job");
                self.queue.delete(&entry.project_id)?;
                continue;
            }
            let launch_id = self.next_launch_id;
            let handle = match self.launcher.launch(&entry, launch_id) {
                Ok(handle) => {
                    self.next_launch_id += 1;
                    handle
                }
                Err(e) => {
                    error!(project_id = %entry.project_id, error = %e, "Failed to start worker");
                    break;
                }
            };
            self.pending.insert(
                entry.project_id.clone(),
                RunningJob {
                    handle,
                    launch_id,
                    simulation: entry.simulation,
                    started: Instant::now(),
                },
            );
            self.queue.delete(&entry.project_id)?;
            available -= 1;
            promoted += 1;

            self.metrics.inc_jobs_promoted();
            self.logger.log_job_promoted(
                &entry.project_id,
                entry.simulation,
                self.pending.len(),
                self.config.max_workers,
            );
        }
        Ok(promoted)
    }

    /// Terminate every running worker and forget it; waiting jobs stay queued
    pub async fn reset_pending(&mut self) {
        let n = self.terminate_all().await;
        self.logger.log_pending_reset(n);
    }

    async fn terminate_all(&mut self) -> usize {
        let jobs: Vec<(String, RunningJob)> = self.pending.drain().collect();
        let n = jobs.len();
        for (project_id, mut job) in jobs {
            if let Err(e) = job.handle.terminate(self.config.shutdown_grace).await {
                warn!(project_id = %project_id, error = %e, "Failed to terminate worker");
            }
            debug!(project_id = %project_id, simulation = job.simulation, "Worker terminated");
        }
        n
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(&mut self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| {
                SiftError::Scheduling(format!("cannot bind {}: {}", self.config.bind_addr, e))
            })?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        &mut self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.bind_addr.clone());
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), &addr, self.config.max_workers);
        if let Some(health) = &self.health {
            health.set_healthy(components::TASK_MANAGER).await;
            health.set_ready(true).await;
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = timeout(self.config.poll_interval, listener.accept()) => {
                    match accepted {
                        Ok(Ok((stream, peer))) => {
                            debug!(peer = %peer, "Accepted connection");
                            self.handle_connection(stream).await;
                        }
                        Ok(Err(e)) => warn!(error = %e, "Accept failed"),
                        Err(_) => {}
                    }
                }
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduling tick failed");
            }
        }

        if let Some(health) = &self.health {
            health.set_ready(false).await;
        }
        let n = self.terminate_all().await;
        self.logger.log_shutdown("shutdown requested", n);
        Ok(())
    }

    /// Read messages until the peer closes its side. Status queries are
    /// answered right away; everything else waits for the next tick.
    async fn handle_connection(&mut self, mut stream: TcpStream) {
        let mut framer = MessageFramer::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match timeout(CONNECTION_READ_TIMEOUT, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(error = %e, "Connection read failed");
                    break;
                }
                Err(_) => {
                    warn!("Client did not close its connection in time");
                    break;
                }
            };

            let frames = match framer.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    self.metrics.inc_protocol_errors();
                    warn!(error = %e, "Dropping connection");
                    break;
                }
            };
            for frame in frames {
                match Message::decode(&frame) {
                    Ok(Message::StatusQuery) => {
                        let reply = self.status();
                        if let Err(e) = write_reply(&mut stream, &reply).await {
                            warn!(error = %e, "Failed to send status reply");
                        }
                    }
                    Ok(message) => self.submit(message),
                    Err(e) => {
                        self.metrics.inc_protocol_errors();
                        warn!(error = %e, "Ignoring malformed message");
                    }
                }
            }
        }
        if !framer.is_idle() {
            self.metrics.inc_protocol_errors();
            warn!("Connection closed mid-message");
        }
    }
}

async fn write_reply(stream: &mut TcpStream, reply: &StatusReply) -> Result<()> {
    stream.write_all(&serde_json::to_vec(reply)?).await?;
    stream.flush().await?;
    Ok(())
}

async fn report_queue_health(
    health: Option<&HealthRegistry>,
    outcome: std::result::Result<(), &SiftError>,
) {
    if let Some(health) = health {
        match outcome {
            Ok(()) => health.set_healthy(components::QUEUE).await,
            Err(e) => health.set_unhealthy(components::QUEUE, e.to_string()).await,
        }
    }
}
