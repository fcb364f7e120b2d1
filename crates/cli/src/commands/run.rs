//! Commands that run jobs in this process: simulate, worker

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use sift_lib::simulation::SimulationReport;
use sift_lib::stopping::StoppingSpec;
use sift_lib::taskmanager::TaskClient;
use sift_lib::worker::{run_job, run_simulation, JobOutcome};
use sift_lib::ComponentRegistry;
use std::path::Path;
use tracing::warn;

use crate::output::{
    format_ratio, print_info, print_json, print_success, print_table, print_warning, FieldRow,
    OutputFormat,
};

/// Run a full simulation against a project directory
pub fn simulate(
    project_dir: &Path,
    stopping: Option<StoppingSpec>,
    format: OutputFormat,
) -> Result<()> {
    let registry = ComponentRegistry::with_builtins();
    let report = match stopping {
        Some(stopping) => run_simulation(project_dir, &stopping, &registry),
        None => match run_job(project_dir, true, &registry) {
            Ok(JobOutcome::Simulated(report)) => Ok(report),
            Ok(other) => return Err(anyhow!("unexpected job outcome {:?}", other)),
            Err(e) => Err(e),
        },
    }
    .with_context(|| format!("Simulation failed for {}", project_dir.display()))?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            print_report(&report);
            Ok(())
        }
    }
}

/// Run one job as a task manager worker and report the result back
pub async fn worker(
    client: &TaskClient,
    project_dir: &Path,
    project_id: Option<String>,
    launch_id: Option<u64>,
    simulation: bool,
    format: OutputFormat,
) -> Result<()> {
    let project_id = match project_id {
        Some(id) => id,
        None => project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Cannot derive a project id from the project directory")?,
    };

    let registry = ComponentRegistry::with_builtins();
    match run_job(project_dir, simulation, &registry) {
        Ok(outcome) => {
            if let Err(e) = client.remove(&project_id, launch_id).await {
                warn!(project_id = %project_id, error = %e, "Failed to report completion");
                print_warning(&format!("Could not reach task manager: {}", e));
            }
            print_outcome(&outcome, format)
        }
        Err(err) => {
            if let Err(e) = client.failure(&project_id, launch_id).await {
                warn!(project_id = %project_id, error = %e, "Failed to report failure");
            }
            Err(anyhow!(err).context(format!("Job failed for {}", project_id)))
        }
    }
}

fn print_outcome(outcome: &JobOutcome, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        return print_json(outcome);
    }
    match outcome {
        JobOutcome::Simulated(report) => print_report(report),
        JobOutcome::Ranked {
            n_ranked,
            training_set,
        } => print_success(&format!(
            "Ranked {} records with a model trained on {} labels",
            n_ranked, training_set
        )),
        JobOutcome::Skipped { reason } => {
            print_info(&format!("Nothing to do: {:?}", reason));
        }
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("{}", "Simulation Report".bold());
    println!("{}", "=".repeat(40));

    let phases: Vec<String> = report
        .transitions
        .iter()
        .map(|t| format!("{:?}@{}", t.phase, t.n_labeled))
        .collect();

    print_table(vec![
        FieldRow::new("Records", report.n_records),
        FieldRow::new("Labeled", report.n_labeled),
        FieldRow::new(
            "Relevant found",
            format!(
                "{}/{} ({})",
                report.n_relevant_found,
                report.n_relevant_total,
                format_ratio(report.n_relevant_found, report.n_relevant_total)
            ),
        ),
        FieldRow::new(
            "Screened",
            format_ratio(report.n_labeled, report.n_records),
        ),
        FieldRow::new("Iterations", report.iterations),
        FieldRow::new("Bootstrap iterations", report.bootstrap_iterations),
        FieldRow::new("Phases", phases.join(" → ")),
        FieldRow::new("Stopped by", report.stopped_by.green()),
        FieldRow::new("Duration", format!("{:.2}s", report.duration_secs)),
    ]);
}
