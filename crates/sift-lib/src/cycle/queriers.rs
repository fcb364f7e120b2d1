//! Query strategies: turn pool scores into a full ranking of pool positions

use super::{parse_params, Params, Querier, Scores};
use crate::error::{Result, SiftError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

fn require_scores<'a>(name: &str, scores: Option<&'a Scores>, n_pool: usize) -> Result<&'a Scores> {
    let scores = scores.ok_or_else(|| {
        SiftError::config(format!("querier '{}' needs classifier scores", name))
    })?;
    if scores.values.len() != n_pool {
        return Err(SiftError::training(format!(
            "querier '{}' got {} scores for a pool of {}",
            name,
            scores.values.len(),
            n_pool
        )));
    }
    Ok(scores)
}

/// Positions sorted by key descending. The sort is stable, so equal keys keep pool order.
/// `total_cmp` keeps the order total even if a NaN slips through.
fn argsort_desc(keys: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| keys[b].total_cmp(&keys[a]));
    order
}

fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Highest relevance score first
#[derive(Debug, Default)]
pub struct MaxQuerier;

impl MaxQuerier {
    pub const NAME: &'static str = "max";
}

impl Querier for MaxQuerier {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn query(&mut self, scores: Option<&Scores>, n_pool: usize) -> Result<Vec<usize>> {
        let scores = require_scores(Self::NAME, scores, n_pool)?;
        Ok(argsort_desc(&scores.values))
    }
}

/// Scores closest to the decision midpoint first
#[derive(Debug, Default)]
pub struct UncertaintyQuerier;

impl UncertaintyQuerier {
    pub const NAME: &'static str = "uncertainty";
}

impl Querier for UncertaintyQuerier {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn query(&mut self, scores: Option<&Scores>, n_pool: usize) -> Result<Vec<usize>> {
        let scores = require_scores(Self::NAME, scores, n_pool)?;
        let midpoint = scores.kind.midpoint();
        let closeness: Vec<f64> = scores
            .values
            .iter()
            .map(|v| -(v - midpoint).abs())
            .collect();
        Ok(argsort_desc(&closeness))
    }
}

/// Pool order, no model involved
#[derive(Debug, Default)]
pub struct TopDownQuerier;

impl TopDownQuerier {
    pub const NAME: &'static str = "top_down";
}

impl Querier for TopDownQuerier {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn needs_scores(&self) -> bool {
        false
    }

    fn query(&mut self, _scores: Option<&Scores>, n_pool: usize) -> Result<Vec<usize>> {
        Ok((0..n_pool).collect())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RandomParams {
    pub seed: Option<u64>,
}

/// Uniform random order
pub struct RandomQuerier {
    params: RandomParams,
    rng: StdRng,
}

impl RandomQuerier {
    pub const NAME: &'static str = "random";

    pub fn new(params: RandomParams) -> Self {
        let rng = rng_from_seed(params.seed);
        Self { params, rng }
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Ok(Self::new(parse_params(Self::NAME, params)?))
    }
}

impl Querier for RandomQuerier {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn needs_scores(&self) -> bool {
        false
    }

    fn query(&mut self, _scores: Option<&Scores>, n_pool: usize) -> Result<Vec<usize>> {
        let mut order: Vec<usize> = (0..n_pool).collect();
        order.shuffle(&mut self.rng);
        Ok(order)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaxRandomParams {
    /// Probability that a ranking slot is filled at random instead of by score
    pub random_fraction: f64,
    pub seed: Option<u64>,
}

impl Default for MaxRandomParams {
    fn default() -> Self {
        Self {
            random_fraction: 0.05,
            seed: None,
        }
    }
}

/// Mostly max, with an occasional random pick to explore the pool
pub struct MaxRandomQuerier {
    params: MaxRandomParams,
    rng: StdRng,
}

impl MaxRandomQuerier {
    pub const NAME: &'static str = "max_random";

    pub fn new(params: MaxRandomParams) -> Result<Self> {
        if !(0.0..=1.0).contains(&params.random_fraction) {
            return Err(SiftError::config(format!(
                "max_random random_fraction must be within [0, 1], got {}",
                params.random_fraction
            )));
        }
        let rng = rng_from_seed(params.seed);
        Ok(Self { params, rng })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(parse_params(Self::NAME, params)?)
    }
}

impl Querier for MaxRandomQuerier {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn query(&mut self, scores: Option<&Scores>, n_pool: usize) -> Result<Vec<usize>> {
        let scores = require_scores(Self::NAME, scores, n_pool)?;
        let mut by_score = argsort_desc(&scores.values);
        let mut order = Vec::with_capacity(n_pool);
        // Remaining candidates stay sorted, so the best one is always at the front
        while !by_score.is_empty() {
            let pick = if self.rng.gen_bool(self.params.random_fraction) {
                self.rng.gen_range(0..by_score.len())
            } else {
                0
            };
            order.push(by_score.remove(pick));
        }
        Ok(order)
    }
}
