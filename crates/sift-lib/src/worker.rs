//! One job for one project: a full simulation or a single train+rank step.
//!
//! Failures are recorded in the project's `error.json` and returned; a failed
//! step never touches the previous ranking snapshot.

use crate::cycle::{ActiveLearningCycle, ComponentRegistry, FeatureMatrix};
use crate::error::{Result, SiftError};
use crate::models::{Label, Record};
use crate::observability::StructuredLogger;
use crate::project::Project;
use crate::simulation::{PriorSettings, Simulation, SimulationReport};
use crate::stopping::{Fittable, StoppingPolicy, StoppingSpec};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoNewLabels,
    PoolEmpty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Simulated(SimulationReport),
    Ranked { n_ranked: usize, training_set: i64 },
    Skipped { reason: SkipReason },
}

/// Run one job against a project directory
pub fn run_job(project_dir: &Path, simulation: bool, registry: &ComponentRegistry) -> Result<JobOutcome> {
    let project = Project::open(project_dir)?;
    let logger = StructuredLogger::new("worker");

    let outcome = if simulation {
        let stopping = project.config().stopping.clone();
        simulate(&project, registry, &logger, &stopping).map(JobOutcome::Simulated)
    } else {
        train_rank_step(&project, registry, &logger)
    };
    finish(&project, outcome)
}

/// Run a simulation with a stopping rule other than the configured one
pub fn run_simulation(
    project_dir: &Path,
    stopping: &StoppingSpec,
    registry: &ComponentRegistry,
) -> Result<SimulationReport> {
    stopping.validate()?;
    let project = Project::open(project_dir)?;
    let logger = StructuredLogger::new("worker");
    let outcome = simulate(&project, registry, &logger, stopping);
    finish(&project, outcome)
}

fn finish<T>(project: &Project, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(outcome) => {
            project.clear_error()?;
            Ok(outcome)
        }
        Err(err) => {
            if let Err(record_err) = project.record_error(&err) {
                warn!(project_id = %project.id(), error = %record_err, "Failed to record job error");
            }
            Err(err)
        }
    }
}

fn simulate(
    project: &Project,
    registry: &ComponentRegistry,
    logger: &StructuredLogger,
    stopping: &StoppingSpec,
) -> Result<SimulationReport> {
    let config = project.config();
    let records = project.load_records()?;
    let mut state = project.open_state()?;

    // Labels already in the state act as priors
    let existing = state.get_priors()?;
    let priors = if existing.is_empty() {
        config.priors.clone()
    } else {
        PriorSettings::ids(existing.iter().map(|r| r.record_id).collect())
    };

    let cycle = config.cycle.build(registry)?;
    let mut sim = Simulation::new(records, cycle, priors, stopping.build())?;
    let report = sim.run_and_flush(&mut state)?;
    logger.log_simulation_completed(&project.id(), &report);
    Ok(report)
}

fn train_rank_step(
    project: &Project,
    registry: &ComponentRegistry,
    logger: &StructuredLogger,
) -> Result<JobOutcome> {
    let project_id = project.id();
    let mut state = project.open_state()?;
    if !state.exist_new_labeled_records()? {
        debug!(project_id = %project_id, "No new labels since the last ranking");
        return Ok(JobOutcome::Skipped {
            reason: SkipReason::NoNewLabels,
        });
    }

    let records = project.load_records()?;
    let results = state.get_results_table()?;
    let queried: HashSet<i64> = results.iter().map(|r| r.record_id).collect();
    let pool: Vec<usize> = (0..records.len())
        .filter(|&i| !queried.contains(&records[i].record_id))
        .collect();
    if pool.is_empty() {
        return Ok(JobOutcome::Skipped {
            reason: SkipReason::PoolEmpty,
        });
    }

    let labeled = state.get_labeled()?;
    let training_set = labeled.len() as i64;
    let mut cycle = if Fittable.rule(&results, &[]) {
        project.config().cycle.build(registry)?
    } else {
        info!(project_id = %project_id, "Labeled set has one class, ranking top-down");
        ActiveLearningCycle::top_down()
    };

    let ranking = if cycle.has_classifier() {
        let positions: HashMap<i64, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.record_id, i))
            .collect();
        let mut train = Vec::with_capacity(labeled.len());
        let mut y: Vec<Label> = Vec::with_capacity(labeled.len());
        for row in &labeled {
            let i = positions.get(&row.record_id).copied().ok_or_else(|| {
                SiftError::config(format!(
                    "labeled record {} is not in {}",
                    row.record_id,
                    crate::project::RECORDS_FILE
                ))
            })?;
            train.push(i);
            if let Some(label) = row.label {
                y.push(label);
            }
        }

        let texts: Vec<String> = records.iter().map(Record::text).collect();
        let x = cycle.transform(&texts)?;
        cycle.fit(&x.select(&train)?, &y)?;
        cycle.rank(&x.select(&pool)?)?
    } else {
        cycle.rank(&FeatureMatrix::new(vec![Vec::new(); pool.len()], 0))?
    };

    let ranked_ids: Vec<i64> = ranking.iter().map(|&p| records[pool[p]].record_id).collect();
    let models = cycle.model_names();
    state.add_last_ranking(&ranked_ids, &models, training_set)?;
    logger.log_ranking_written(
        &project_id,
        ranked_ids.len(),
        training_set,
        models.classifier.as_deref(),
    );

    Ok(JobOutcome::Ranked {
        n_ranked: ranked_ids.len(),
        training_set,
    })
}
