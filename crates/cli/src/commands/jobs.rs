//! Task manager commands: enqueue, status, reset

use anyhow::{Context, Result};
use colored::Colorize;
use sift_lib::taskmanager::TaskClient;
use tabled::Tabled;

use crate::output::{color_slots, print_info, print_json, print_success, print_table, OutputFormat};

#[derive(Tabled)]
struct RunningRow {
    #[tabled(rename = "Project")]
    project_id: String,
}

pub async fn enqueue(
    client: &TaskClient,
    project_id: &str,
    simulation: bool,
    format: OutputFormat,
) -> Result<()> {
    client
        .insert(project_id, simulation)
        .await
        .with_context(|| format!("Failed to enqueue {}", project_id))?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "enqueued": project_id,
            "simulation": simulation,
        })),
        OutputFormat::Table => {
            let kind = if simulation { "simulation" } else { "training step" };
            print_success(&format!("Enqueued {} for {}", kind, project_id.cyan()));
            Ok(())
        }
    }
}

pub async fn status(client: &TaskClient, format: OutputFormat) -> Result<()> {
    let status = client
        .status()
        .await
        .context("Failed to query task manager status")?;

    match format {
        OutputFormat::Json => print_json(&status),
        OutputFormat::Table => {
            println!("{}", "Task Manager".bold());
            println!("{}", "=".repeat(40));
            println!("Address:   {}", client.addr().cyan());
            println!("Running:   {}", status.currently_running);
            println!(
                "Available: {}",
                color_slots(status.available_slots, status.max_workers)
            );
            println!();

            if status.running_project_ids.is_empty() {
                print_info("No jobs running");
                return Ok(());
            }
            print_table(
                status
                    .running_project_ids
                    .into_iter()
                    .map(|project_id| RunningRow { project_id })
                    .collect(),
            );
            Ok(())
        }
    }
}

pub async fn reset(client: &TaskClient, format: OutputFormat) -> Result<()> {
    client
        .reset_pending()
        .await
        .context("Failed to reset running jobs")?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "reset": true })),
        OutputFormat::Table => {
            print_success("Running workers terminated; waiting jobs kept");
            Ok(())
        }
    }
}
