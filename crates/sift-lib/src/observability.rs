//! Metrics and structured events for the task manager and workers
//!
//! Provides:
//! - Prometheus metrics for the job lifecycle, registered once per process
//! - A structured logger emitting one `event = ...` record per milestone

use crate::simulation::SimulationReport;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Job duration buckets in seconds; a simulation can take many minutes
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
];

static GLOBAL_METRICS: OnceLock<SiftMetricsInner> = OnceLock::new();

struct SiftMetricsInner {
    jobs_enqueued: IntCounter,
    jobs_promoted: IntCounter,
    jobs_completed: IntCounter,
    jobs_failed: IntCounter,
    protocol_errors: IntCounter,
    running_workers: IntGauge,
    waiting_jobs: IntGauge,
    job_duration_seconds: Histogram,
}

impl SiftMetricsInner {
    fn new() -> Self {
        Self {
            jobs_enqueued: register_int_counter!(
                "sift_jobs_enqueued_total",
                "Insert messages accepted into the waiting queue"
            )
            .expect("Failed to register jobs_enqueued"),

            jobs_promoted: register_int_counter!(
                "sift_jobs_promoted_total",
                "Jobs moved from the waiting queue to a running worker"
            )
            .expect("Failed to register jobs_promoted"),

            jobs_completed: register_int_counter!(
                "sift_jobs_completed_total",
                "Jobs whose worker reported success"
            )
            .expect("Failed to register jobs_completed"),

            jobs_failed: register_int_counter!(
                "sift_jobs_failed_total",
                "Jobs whose worker reported or exited with a failure"
            )
            .expect("Failed to register jobs_failed"),

            protocol_errors: register_int_counter!(
                "sift_protocol_errors_total",
                "Malformed messages received on the task manager socket"
            )
            .expect("Failed to register protocol_errors"),

            running_workers: register_int_gauge!(
                "sift_running_workers",
                "Worker subprocesses currently running"
            )
            .expect("Failed to register running_workers"),

            waiting_jobs: register_int_gauge!(
                "sift_waiting_jobs",
                "Jobs in the durable waiting queue"
            )
            .expect("Failed to register waiting_jobs"),

            job_duration_seconds: register_histogram!(
                "sift_job_duration_seconds",
                "Wall time from promotion to completion of a job",
                JOB_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register job_duration_seconds"),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same collectors
#[derive(Clone)]
pub struct SiftMetrics {
    _private: (),
}

impl Default for SiftMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SiftMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SiftMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SiftMetricsInner {
        GLOBAL_METRICS.get_or_init(SiftMetricsInner::new)
    }

    pub fn inc_jobs_enqueued(&self) {
        self.inner().jobs_enqueued.inc();
    }

    pub fn inc_jobs_promoted(&self) {
        self.inner().jobs_promoted.inc();
    }

    pub fn inc_jobs_completed(&self) {
        self.inner().jobs_completed.inc();
    }

    pub fn inc_jobs_failed(&self) {
        self.inner().jobs_failed.inc();
    }

    pub fn inc_protocol_errors(&self) {
        self.inner().protocol_errors.inc();
    }

    pub fn set_running_workers(&self, n: usize) {
        self.inner().running_workers.set(n as i64);
    }

    pub fn set_waiting_jobs(&self, n: usize) {
        self.inner().waiting_jobs.set(n as i64);
    }

    pub fn observe_job_duration(&self, secs: f64) {
        self.inner().job_duration_seconds.observe(secs);
    }
}

/// Structured logger for scheduler and training milestones
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str, bind_addr: &str, max_workers: usize) {
        info!(
            event = "task_manager_started",
            component = %self.component,
            version = %version,
            bind_addr = %bind_addr,
            max_workers = max_workers,
            "Task manager started"
        );
    }

    pub fn log_shutdown(&self, reason: &str, terminated_workers: usize) {
        info!(
            event = "task_manager_shutdown",
            component = %self.component,
            reason = %reason,
            terminated_workers = terminated_workers,
            "Task manager shutting down"
        );
    }

    pub fn log_job_enqueued(&self, project_id: &str, simulation: bool) {
        info!(
            event = "job_enqueued",
            component = %self.component,
            project_id = %project_id,
            simulation = simulation,
            "Job added to waiting queue"
        );
    }

    pub fn log_job_promoted(&self, project_id: &str, simulation: bool, running: usize, max_workers: usize) {
        info!(
            event = "job_promoted",
            component = %self.component,
            project_id = %project_id,
            simulation = simulation,
            running = running,
            max_workers = max_workers,
            "Worker started"
        );
    }

    pub fn log_job_completed(&self, project_id: &str, duration_secs: Option<f64>) {
        info!(
            event = "job_completed",
            component = %self.component,
            project_id = %project_id,
            duration_secs = ?duration_secs,
            "Job completed"
        );
    }

    pub fn log_job_failed(&self, project_id: &str, reason: &str) {
        warn!(
            event = "job_failed",
            component = %self.component,
            project_id = %project_id,
            reason = %reason,
            "Job failed, not retrying"
        );
    }

    pub fn log_pending_reset(&self, terminated: usize) {
        warn!(
            event = "pending_reset",
            component = %self.component,
            terminated = terminated,
            "Terminated running workers and cleared pending jobs"
        );
    }

    pub fn log_ranking_written(
        &self,
        project_id: &str,
        n_ranked: usize,
        training_set: i64,
        classifier: Option<&str>,
    ) {
        info!(
            event = "ranking_written",
            component = %self.component,
            project_id = %project_id,
            n_ranked = n_ranked,
            training_set = training_set,
            classifier = classifier.unwrap_or("none"),
            "Ranking snapshot written"
        );
    }

    pub fn log_simulation_completed(&self, project_id: &str, report: &SimulationReport) {
        info!(
            event = "simulation_completed",
            component = %self.component,
            project_id = %project_id,
            n_records = report.n_records,
            n_labeled = report.n_labeled,
            n_relevant_found = report.n_relevant_found,
            n_relevant_total = report.n_relevant_total,
            iterations = report.iterations,
            stopped_by = %report.stopped_by,
            duration_secs = report.duration_secs,
            "Simulation completed"
        );
    }
}
