//! Class rebalancing through per-sample weights

use super::{parse_params, Balancer, Params};
use crate::error::{Result, SiftError};
use crate::models::Label;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalancedParams {
    /// Summed weight of relevant samples divided by summed weight of irrelevant ones
    pub ratio: f64,
}

impl Default for BalancedParams {
    fn default() -> Self {
        Self { ratio: 1.0 }
    }
}

/// Weights each class so the summed class weights follow a fixed ratio.
///
/// Weights always sum to `len(y)`. With a single class present there is no
/// ratio to enforce and every sample weighs 1.0.
#[derive(Debug, Clone)]
pub struct BalancedBalancer {
    params: BalancedParams,
}

impl BalancedBalancer {
    pub const NAME: &'static str = "balanced";

    pub fn new(params: BalancedParams) -> Result<Self> {
        if !(params.ratio.is_finite() && params.ratio > 0.0) {
            return Err(SiftError::config(format!(
                "balanced ratio must be a positive number, got {}",
                params.ratio
            )));
        }
        Ok(Self { params })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(parse_params(Self::NAME, params)?)
    }

    pub fn ratio(&self) -> f64 {
        self.params.ratio
    }
}

impl Balancer for BalancedBalancer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn compute_sample_weight(&self, y: &[Label]) -> Vec<f64> {
        let n = y.len() as f64;
        let n_relevant = y.iter().filter(|l| l.is_relevant()).count() as f64;
        let n_irrelevant = n - n_relevant;
        if n_relevant == 0.0 || n_irrelevant == 0.0 {
            return vec![1.0; y.len()];
        }

        let ratio = self.params.ratio;
        let relevant_total = n * ratio / (1.0 + ratio);
        let irrelevant_total = n / (1.0 + ratio);
        let w_relevant = relevant_total / n_relevant;
        let w_irrelevant = irrelevant_total / n_irrelevant;

        y.iter()
            .map(|l| if l.is_relevant() { w_relevant } else { w_irrelevant })
            .collect()
    }
}
