//! Active-learning cycle
//!
//! A cycle composes a feature extractor, an optional classifier, an optional
//! balancer and a querier behind one `transform` / `fit` / `rank` contract.
//! Components are looked up by name through a [`ComponentRegistry`].

mod balancers;
mod classifiers;
mod features;
mod queriers;
mod registry;

pub use balancers::{BalancedBalancer, BalancedParams};
pub use classifiers::{
    LinearSvm, LinearSvmParams, LogisticParams, LogisticRegression, NaiveBayes, NaiveBayesParams,
};
pub use features::{sparse_dot, FeatureMatrix, TfidfExtractor, TfidfParams};
pub use queriers::{
    MaxQuerier, MaxRandomParams, MaxRandomQuerier, RandomParams, RandomQuerier, TopDownQuerier,
    UncertaintyQuerier,
};
pub use registry::{ComponentKind, ComponentRegistry, Factory};

use crate::error::{Result, SiftError};
use crate::models::{Label, ModelNames, ResultRow};
use crate::stopping::{StoppingPolicy, StoppingSpec};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Free-form component parameters as they appear in a cycle descriptor
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Deserialize a component's parameter struct, mapping failures to configuration errors
pub(crate) fn parse_params<T: DeserializeOwned>(name: &str, params: &Params) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| SiftError::config(format!("invalid parameters for '{}': {}", name, e)))
}

/// How a classifier's scores should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    /// Probability of relevance in [0, 1]
    Probability,
    /// Signed distance to the decision boundary
    Decision,
}

impl ScoreKind {
    pub fn midpoint(self) -> f64 {
        match self {
            ScoreKind::Probability => 0.5,
            ScoreKind::Decision => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    pub values: Vec<f64>,
    pub kind: ScoreKind,
}

pub trait FeatureExtractor: Send {
    fn name(&self) -> &str;
    fn params(&self) -> serde_json::Value;
    fn fit_transform(&mut self, texts: &[String]) -> Result<FeatureMatrix>;
}

pub trait Classifier: Send {
    fn name(&self) -> &str;
    fn params(&self) -> serde_json::Value;
    fn fit(&mut self, x: &FeatureMatrix, y: &[Label], sample_weight: Option<&[f64]>) -> Result<()>;

    /// Probability of relevance per row; `Ok(None)` when unsupported
    fn predict_proba(&self, _x: &FeatureMatrix) -> Result<Option<Vec<f64>>> {
        Ok(None)
    }

    /// Decision score per row; `Ok(None)` when unsupported
    fn decision_function(&self, _x: &FeatureMatrix) -> Result<Option<Vec<f64>>> {
        Ok(None)
    }
}

pub trait Querier: Send {
    fn name(&self) -> &str;
    fn params(&self) -> serde_json::Value;

    /// Whether `query` requires classifier scores
    fn needs_scores(&self) -> bool {
        true
    }

    /// Return a permutation of `0..n_pool`, most wanted first
    fn query(&mut self, scores: Option<&Scores>, n_pool: usize) -> Result<Vec<usize>>;
}

pub trait Balancer: Send {
    fn name(&self) -> &str;
    fn params(&self) -> serde_json::Value;

    /// Per-sample weights summing to `y.len()`
    fn compute_sample_weight(&self, y: &[Label]) -> Vec<f64>;
}

/// Number of records to surface after each training step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NQuery {
    Fixed(usize),
    /// A fraction of the labeled records so far, bounded by `min` and `max`
    Relative {
        fraction: f64,
        #[serde(default = "default_relative_min")]
        min: usize,
        #[serde(default)]
        max: Option<usize>,
    },
}

fn default_relative_min() -> usize {
    1
}

impl Default for NQuery {
    fn default() -> Self {
        NQuery::Fixed(1)
    }
}

impl NQuery {
    fn validate(&self) -> Result<()> {
        match self {
            NQuery::Fixed(0) => Err(SiftError::config("n_query must be at least 1")),
            NQuery::Relative { fraction, .. } if !(*fraction > 0.0 && fraction.is_finite()) => {
                Err(SiftError::config("n_query fraction must be positive"))
            }
            NQuery::Relative { min, max: Some(max), .. } if max < min || *max == 0 => {
                Err(SiftError::config("n_query max must be at least min and at least 1"))
            }
            _ => Ok(()),
        }
    }

    /// Uncapped query size given the number of labeled results
    pub fn resolve(&self, n_labeled: usize) -> usize {
        match self {
            NQuery::Fixed(n) => (*n).max(1),
            NQuery::Relative { fraction, min, max } => {
                let n = (fraction * n_labeled as f64).ceil() as usize;
                n.max(*min).min(max.unwrap_or(usize::MAX)).max(1)
            }
        }
    }
}

/// One configured composition of components
pub struct ActiveLearningCycle {
    classifier: Option<Box<dyn Classifier>>,
    querier: Box<dyn Querier>,
    balancer: Option<Box<dyn Balancer>>,
    feature_extractor: Option<Box<dyn FeatureExtractor>>,
    n_query: NQuery,
    stopper: Option<Box<dyn StoppingPolicy>>,
}

impl ActiveLearningCycle {
    pub fn new(querier: Box<dyn Querier>) -> Self {
        Self {
            classifier: None,
            querier,
            balancer: None,
            feature_extractor: None,
            n_query: NQuery::default(),
            stopper: None,
        }
    }

    /// Model-free cycle that surfaces records in pool order
    pub fn top_down() -> Self {
        Self::new(Box::new(TopDownQuerier))
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_balancer(mut self, balancer: Box<dyn Balancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn with_feature_extractor(mut self, extractor: Box<dyn FeatureExtractor>) -> Self {
        self.feature_extractor = Some(extractor);
        self
    }

    pub fn with_n_query(mut self, n_query: NQuery) -> Self {
        self.n_query = n_query;
        self
    }

    pub fn with_stopper(mut self, stopper: Box<dyn StoppingPolicy>) -> Self {
        self.stopper = Some(stopper);
        self
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn has_feature_extractor(&self) -> bool {
        self.feature_extractor.is_some()
    }

    pub fn model_names(&self) -> ModelNames {
        ModelNames {
            classifier: self.classifier.as_ref().map(|c| c.name().to_string()),
            querier: Some(self.querier.name().to_string()),
            balancer: self.balancer.as_ref().map(|b| b.name().to_string()),
            feature_extractor: self
                .feature_extractor
                .as_ref()
                .map(|f| f.name().to_string()),
        }
    }

    /// Apply the feature extractor to the full dataset
    pub fn transform(&mut self, texts: &[String]) -> Result<FeatureMatrix> {
        let extractor = self
            .feature_extractor
            .as_mut()
            .ok_or_else(|| SiftError::config("cycle has no feature extractor"))?;
        extractor.fit_transform(texts)
    }

    /// Fit the classifier on the labeled rows; a no-op for model-free cycles
    pub fn fit(&mut self, x: &FeatureMatrix, y: &[Label]) -> Result<()> {
        let Some(classifier) = self.classifier.as_mut() else {
            return Ok(());
        };
        if x.n_rows() != y.len() {
            return Err(SiftError::training(format!(
                "{} feature rows for {} labels",
                x.n_rows(),
                y.len()
            )));
        }
        let weights = self.balancer.as_ref().map(|b| b.compute_sample_weight(y));
        debug!(
            classifier = classifier.name(),
            n_labeled = y.len(),
            balanced = weights.is_some(),
            "Fitting classifier"
        );
        classifier.fit(x, y, weights.as_deref())
    }

    /// Rank pool rows; returns a permutation of `0..x_pool.n_rows()`
    pub fn rank(&mut self, x_pool: &FeatureMatrix) -> Result<Vec<usize>> {
        let n_pool = x_pool.n_rows();
        let scores = match self.classifier.as_ref() {
            None => None,
            Some(classifier) => Some(score_pool(classifier.as_ref(), x_pool)?),
        };
        if scores.is_none() && self.querier.needs_scores() {
            return Err(SiftError::config(format!(
                "querier '{}' needs a classifier",
                self.querier.name()
            )));
        }
        let ranking = self.querier.query(scores.as_ref(), n_pool)?;
        ensure_permutation(&ranking, n_pool)?;
        Ok(ranking)
    }

    /// How many top-ranked records to surface next, capped at the unlabeled remainder
    pub fn get_n_query(&self, results: &[ResultRow], n_records: usize) -> usize {
        let n_labeled = results.iter().filter(|r| r.label.is_some()).count();
        let remaining = n_records.saturating_sub(results.len());
        self.n_query.resolve(n_labeled).min(remaining)
    }

    /// The cycle's own stopping rule; false when none is configured
    pub fn stop(&self, results: &[ResultRow], labels: &[Label]) -> bool {
        self.stopper
            .as_ref()
            .map(|s| s.stop(results, labels))
            .unwrap_or(false)
    }
}

fn score_pool(classifier: &dyn Classifier, x_pool: &FeatureMatrix) -> Result<Scores> {
    let scores = if let Some(values) = classifier.predict_proba(x_pool)? {
        Scores {
            values,
            kind: ScoreKind::Probability,
        }
    } else if let Some(values) = classifier.decision_function(x_pool)? {
        Scores {
            values,
            kind: ScoreKind::Decision,
        }
    } else {
        return Err(SiftError::Capability(classifier.name().to_string()));
    };
    if scores.values.len() != x_pool.n_rows() {
        return Err(SiftError::training(format!(
            "classifier '{}' returned {} scores for {} rows",
            classifier.name(),
            scores.values.len(),
            x_pool.n_rows()
        )));
    }
    if let Some(row) = scores.values.iter().position(|v| !v.is_finite()) {
        return Err(SiftError::training(format!(
            "classifier '{}' returned a non-finite score for pool row {}",
            classifier.name(),
            row
        )));
    }
    Ok(scores)
}

fn ensure_permutation(ranking: &[usize], n: usize) -> Result<()> {
    let mut seen = vec![false; n];
    for &i in ranking {
        match seen.get_mut(i) {
            Some(slot) if !*slot => *slot = true,
            _ => {
                return Err(SiftError::training(format!(
                    "querier returned an invalid ranking (index {} for pool of {})",
                    i, n
                )))
            }
        }
    }
    if ranking.len() != n {
        return Err(SiftError::training(format!(
            "querier ranked {} of {} pool records",
            ranking.len(),
            n
        )));
    }
    Ok(())
}

/// Serializable cycle configuration, owned by a review project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CycleDescriptor {
    #[serde(default)]
    pub classifier: Option<String>,
    #[serde(default)]
    pub classifier_params: Params,
    pub querier: String,
    #[serde(default)]
    pub querier_params: Params,
    #[serde(default)]
    pub balancer: Option<String>,
    #[serde(default)]
    pub balancer_params: Params,
    #[serde(default)]
    pub feature_extractor: Option<String>,
    #[serde(default)]
    pub feature_extractor_params: Params,
    #[serde(default)]
    pub n_query: NQuery,
    /// Per-cycle stopping rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopping: Option<StoppingSpec>,
}

impl Default for CycleDescriptor {
    fn default() -> Self {
        Self {
            classifier: Some(NaiveBayes::NAME.to_string()),
            classifier_params: Params::new(),
            querier: MaxQuerier::NAME.to_string(),
            querier_params: Params::new(),
            balancer: Some(BalancedBalancer::NAME.to_string()),
            balancer_params: Params::new(),
            feature_extractor: Some(TfidfExtractor::NAME.to_string()),
            feature_extractor_params: Params::new(),
            n_query: NQuery::default(),
            stopping: None,
        }
    }
}

impl CycleDescriptor {
    /// The bootstrap descriptor: no model, records in pool order
    pub fn top_down() -> Self {
        Self {
            classifier: None,
            querier: TopDownQuerier::NAME.to_string(),
            balancer: None,
            feature_extractor: None,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(raw)
            .map_err(|e| SiftError::config(format!("malformed cycle descriptor: {}", e)))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.querier.trim().is_empty() {
            return Err(SiftError::config("cycle descriptor needs a querier"));
        }
        if self.classifier.is_some() && self.feature_extractor.is_none() {
            return Err(SiftError::config(
                "a cycle with a classifier needs a feature extractor",
            ));
        }
        if self.balancer.is_some() && self.classifier.is_none() {
            return Err(SiftError::config("a balancer needs a classifier"));
        }
        if let Some(stopping) = &self.stopping {
            stopping.validate()?;
        }
        self.n_query.validate()
    }

    /// Resolve every component by name
    pub fn build(&self, registry: &ComponentRegistry) -> Result<ActiveLearningCycle> {
        self.validate()?;
        let mut cycle = ActiveLearningCycle::new(registry.querier(&self.querier, &self.querier_params)?)
            .with_n_query(self.n_query.clone());
        if let Some(name) = &self.classifier {
            cycle = cycle.with_classifier(registry.classifier(name, &self.classifier_params)?);
        }
        if let Some(name) = &self.balancer {
            cycle = cycle.with_balancer(registry.balancer(name, &self.balancer_params)?);
        }
        if let Some(name) = &self.feature_extractor {
            cycle = cycle.with_feature_extractor(
                registry.feature_extractor(name, &self.feature_extractor_params)?,
            );
        }
        if let Some(spec) = &self.stopping {
            cycle = cycle.with_stopper(spec.build());
        }
        Ok(cycle)
    }
}
