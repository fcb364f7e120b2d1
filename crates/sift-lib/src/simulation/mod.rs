//! Simulation driver
//!
//! Replays a fully labeled dataset through the active-learning loop:
//! - seed priors (explicit ids or sampled from the ground truth)
//! - bootstrap with a model-free top-down cycle until both classes are present
//! - train, rank and label the top records until the stopping policy fires
//!
//! Results stay in a [`ResultsBuffer`] until the run succeeds; [`Simulation::flush`]
//! then writes them and the final ranking of the remaining pool to the state.

mod buffer;


pub use buffer::{BufferStats, ResultsBuffer};

use crate::cycle::{ActiveLearningCycle, FeatureMatrix};
use crate::error::{Result, SiftError};
use crate::models::{Label, ModelNames, Record, ResultRow};
use crate::state::State;
use crate::stopping::{Fittable, StoppingPolicy};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info};

/// How the seed labels are chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorSettings {
    /// Explicit prior record ids; overrides the sampled counts
    pub prior_ids: Option<Vec<i64>>,
    pub n_prior_included: usize,
    pub n_prior_excluded: usize,
    pub seed: Option<u64>,
}

impl Default for PriorSettings {
    fn default() -> Self {
        Self {
            prior_ids: None,
            n_prior_included: 1,
            n_prior_excluded: 1,
            seed: None,
        }
    }
}

impl PriorSettings {
    pub fn ids(prior_ids: Vec<i64>) -> Self {
        Self {
            prior_ids: Some(prior_ids),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Bootstrap,
    Active,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: Phase,
    /// Labeled records when the phase was entered
    pub n_labeled: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub n_records: usize,
    pub n_labeled: usize,
    pub n_relevant_total: usize,
    pub n_relevant_found: usize,
    pub iterations: usize,
    pub bootstrap_iterations: usize,
    pub transitions: Vec<PhaseTransition>,
    pub stopped_by: String,
    pub duration_secs: f64,
}

/// Ranking of the pool from the latest iteration
struct Snapshot {
    ranked_ids: Vec<i64>,
    models: ModelNames,
    training_set: i64,
}

pub struct Simulation {
    records: Vec<Record>,
    labels: Vec<Label>,
    cycle: ActiveLearningCycle,
    bootstrap: ActiveLearningCycle,
    stopper: Box<dyn StoppingPolicy>,
    priors: PriorSettings,
    buffer: ResultsBuffer,
    phase: Phase,
    features: Option<FeatureMatrix>,
    snapshot: Option<Snapshot>,
}

impl Simulation {
    /// Every record must carry a ground-truth label.
    pub fn new(
        records: Vec<Record>,
        cycle: ActiveLearningCycle,
        priors: PriorSettings,
        stopper: Box<dyn StoppingPolicy>,
    ) -> Result<Self> {
        let mut seen = HashSet::with_capacity(records.len());
        let mut labels = Vec::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.record_id) {
                return Err(SiftError::DuplicateRecord(record.record_id));
            }
            let label = record.included.ok_or_else(|| {
                SiftError::config(format!(
                    "record {} has no ground-truth label; simulation needs a fully labeled dataset",
                    record.record_id
                ))
            })?;
            labels.push(label);
        }

        Ok(Self {
            buffer: ResultsBuffer::with_capacity(records.len()),
            records,
            labels,
            cycle,
            bootstrap: ActiveLearningCycle::top_down(),
            stopper,
            priors,
            phase: Phase::Bootstrap,
            features: None,
            snapshot: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Buffered results so far
    pub fn results(&self) -> &[ResultRow] {
        self.buffer.rows()
    }

    /// Run until the stopping policy fires. Nothing is written to any state.
    pub fn run(&mut self) -> Result<SimulationReport> {
        let started = Instant::now();
        self.seed_priors()?;

        let mut transitions = vec![PhaseTransition {
            phase: self.phase,
            n_labeled: self.buffer.len(),
        }];
        let mut iterations = 0;
        let mut bootstrap_iterations = 0;

        let stopped_by = loop {
            let rows = self.buffer.rows();
            if self.stopper.stop(rows, &self.labels) {
                break self.stopper.name().to_string();
            }
            if self.phase == Phase::Active && self.cycle.stop(rows, &self.labels) {
                break "cycle".to_string();
            }
            if self.phase == Phase::Bootstrap && Fittable.rule(rows, &self.labels) {
                self.enter(Phase::Active, &mut transitions);
                continue;
            }

            self.step()?;
            iterations += 1;
            if self.phase == Phase::Bootstrap {
                bootstrap_iterations += 1;
            }
        };
        self.enter(Phase::Stopped, &mut transitions);

        let stats = self.buffer.stats();
        let report = SimulationReport {
            n_records: self.records.len(),
            n_labeled: stats.relevant + stats.irrelevant,
            n_relevant_total: self.labels.iter().filter(|l| l.is_relevant()).count(),
            n_relevant_found: stats.relevant,
            iterations,
            bootstrap_iterations,
            transitions,
            stopped_by,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            n_records = report.n_records,
            n_labeled = report.n_labeled,
            n_relevant_found = report.n_relevant_found,
            iterations = report.iterations,
            stopped_by = %report.stopped_by,
            "Simulation finished"
        );
        Ok(report)
    }

    /// Write buffered results and the final ranking of the remaining pool
    pub fn flush(&mut self, state: &mut State) -> Result<()> {
        let rows = self.buffer.drain();
        let training_set = rows.len() as i64;
        state.write_results(&rows)?;

        let snapshot = match self.snapshot.take() {
            Some(snapshot) => snapshot,
            None => Snapshot {
                ranked_ids: self.records.iter().map(|r| r.record_id).collect(),
                models: self.bootstrap.model_names(),
                training_set,
            },
        };
        state.add_last_ranking(&snapshot.ranked_ids, &snapshot.models, snapshot.training_set)?;
        debug!(n_results = rows.len(), "Flushed simulation results");
        Ok(())
    }

    /// Run, then flush on success only
    pub fn run_and_flush(&mut self, state: &mut State) -> Result<SimulationReport> {
        let report = self.run()?;
        self.flush(state)?;
        Ok(report)
    }

    fn enter(&mut self, phase: Phase, transitions: &mut Vec<PhaseTransition>) {
        debug!(from = ?self.phase, to = ?phase, n_labeled = self.buffer.len(), "Simulation phase change");
        self.phase = phase;
        transitions.push(PhaseTransition {
            phase,
            n_labeled: self.buffer.len(),
        });
    }

    fn seed_priors(&mut self) -> Result<()> {
        let indices = match &self.priors.prior_ids {
            Some(ids) => {
                let positions: HashMap<i64, usize> = self
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (r.record_id, i))
                    .collect();
                ids.iter()
                    .map(|id| {
                        positions.get(id).copied().ok_or_else(|| {
                            SiftError::config(format!("prior record {} is not in the dataset", id))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            None => self.sample_priors()?,
        };

        let time = Utc::now();
        for i in indices {
            let mut row = ResultRow::prior(self.records[i].record_id, self.labels[i]);
            row.time = Some(time);
            self.buffer.push(row)?;
        }
        debug!(n_priors = self.buffer.len(), "Seeded priors");
        Ok(())
    }

    /// An empty dataset has nothing to sample; the exhausted pool stops the run.
    fn sample_priors(&self) -> Result<Vec<usize>> {
        if self.records.is_empty() {
            return Ok(Vec::new());
        }
        let mut rng = match self.priors.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (mut relevant, mut irrelevant): (Vec<usize>, Vec<usize>) =
            (0..self.labels.len()).partition(|&i| self.labels[i].is_relevant());

        let n_included = self.priors.n_prior_included;
        let n_excluded = self.priors.n_prior_excluded;
        if relevant.len() < n_included || irrelevant.len() < n_excluded {
            return Err(SiftError::config(format!(
                "cannot sample {} relevant and {} irrelevant priors from {} relevant and {} irrelevant records",
                n_included,
                n_excluded,
                relevant.len(),
                irrelevant.len()
            )));
        }
        relevant.shuffle(&mut rng);
        irrelevant.shuffle(&mut rng);

        let mut picked: Vec<usize> = relevant[..n_included]
            .iter()
            .chain(&irrelevant[..n_excluded])
            .copied()
            .collect();
        picked.sort_unstable();
        Ok(picked)
    }

    /// One rank-and-label iteration
    fn step(&mut self) -> Result<()> {
        let pool: Vec<usize> = (0..self.records.len())
            .filter(|&i| !self.buffer.contains(self.records[i].record_id))
            .collect();
        let training_set = self.buffer.len() as i64;

        let (ranking, models, n_query) = match self.phase {
            Phase::Bootstrap => {
                let x_pool = FeatureMatrix::new(vec![Vec::new(); pool.len()], 0);
                let ranking = self.bootstrap.rank(&x_pool)?;
                let n_query = self.bootstrap.get_n_query(self.buffer.rows(), self.records.len());
                (ranking, self.bootstrap.model_names(), n_query)
            }
            _ => {
                self.ensure_features()?;
                let features = self
                    .features
                    .as_ref()
                    .ok_or_else(|| SiftError::training("feature matrix missing"))?;
                let positions: HashMap<i64, usize> = self
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (r.record_id, i))
                    .collect();
                let train: Vec<usize> = self
                    .buffer
                    .rows()
                    .iter()
                    .filter(|r| r.label.is_some())
                    .filter_map(|r| positions.get(&r.record_id).copied())
                    .collect();
                let y: Vec<Label> = train.iter().map(|&i| self.labels[i]).collect();
                let x_train = features.select(&train)?;
                let x_pool = features.select(&pool)?;

                self.cycle.fit(&x_train, &y)?;
                let ranking = self.cycle.rank(&x_pool)?;
                let n_query = self.cycle.get_n_query(self.buffer.rows(), self.records.len());
                (ranking, self.cycle.model_names(), n_query)
            }
        };

        let time = Utc::now();
        let ranked_ids: Vec<i64> = ranking
            .iter()
            .map(|&p| self.records[pool[p]].record_id)
            .collect();
        for &p in ranking.iter().take(n_query) {
            let i = pool[p];
            self.buffer.push(ResultRow {
                record_id: self.records[i].record_id,
                label: Some(self.labels[i]),
                models: models.clone(),
                training_set: Some(training_set),
                time: Some(time),
                note: None,
                tags: None,
                user_id: None,
            })?;
        }

        self.snapshot = Some(Snapshot {
            ranked_ids,
            models,
            training_set,
        });
        Ok(())
    }

    /// Features for the whole dataset, extracted once per run
    fn ensure_features(&mut self) -> Result<()> {
        if self.features.is_none() {
            let matrix = if self.cycle.has_feature_extractor() {
                let texts: Vec<String> = self.records.iter().map(Record::text).collect();
                self.cycle.transform(&texts)?
            } else {
                FeatureMatrix::new(vec![Vec::new(); self.records.len()], 0)
            };
            self.features = Some(matrix);
        }
        Ok(())
    }
}
