//! Built-in classifiers
//!
//! All of them score the relevant class: higher means more likely relevant.

use super::features::{sparse_dot, FeatureMatrix};
use super::{parse_params, Classifier, Params};
use crate::error::{Result, SiftError};
use crate::models::Label;
use serde::{Deserialize, Serialize};

/// Validate shapes and resolve sample weights (defaulting to 1.0)
fn prepare_fit(
    name: &str,
    x: &FeatureMatrix,
    y: &[Label],
    sample_weight: Option<&[f64]>,
) -> Result<Vec<f64>> {
    if x.n_rows() != y.len() {
        return Err(SiftError::training(format!(
            "{}: {} feature rows but {} labels",
            name,
            x.n_rows(),
            y.len()
        )));
    }
    let weights = match sample_weight {
        Some(w) if w.len() != y.len() => {
            return Err(SiftError::training(format!(
                "{}: {} sample weights for {} labels",
                name,
                w.len(),
                y.len()
            )))
        }
        Some(w) => w.to_vec(),
        None => vec![1.0; y.len()],
    };
    let has_relevant = y.iter().any(|l| l.is_relevant());
    let has_irrelevant = y.iter().any(|l| !l.is_relevant());
    if !(has_relevant && has_irrelevant) {
        return Err(SiftError::training(format!(
            "{}: training data needs both relevant and irrelevant examples",
            name
        )));
    }
    Ok(weights)
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

fn not_fitted(name: &str) -> SiftError {
    SiftError::training(format!("{} used before fit", name))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NaiveBayesParams {
    /// Additive (Laplace/Lidstone) smoothing
    pub alpha: f64,
}

impl Default for NaiveBayesParams {
    fn default() -> Self {
        Self { alpha: 3.822 }
    }
}

/// Multinomial naive Bayes over non-negative features
pub struct NaiveBayes {
    params: NaiveBayesParams,
    /// Indexed by `Label::as_i64`
    class_log_prior: [f64; 2],
    feature_log_prob: [Vec<f64>; 2],
    fitted: bool,
}

impl NaiveBayes {
    pub const NAME: &'static str = "nb";

    pub fn new(params: NaiveBayesParams) -> Result<Self> {
        if params.alpha <= 0.0 {
            return Err(SiftError::config("nb alpha must be positive"));
        }
        Ok(Self {
            params,
            class_log_prior: [0.0; 2],
            feature_log_prob: [Vec::new(), Vec::new()],
            fitted: false,
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(parse_params(Self::NAME, params)?)
    }

    fn joint_log_likelihood(&self, row: &[(usize, f64)], class: usize) -> f64 {
        self.class_log_prior[class] + sparse_dot(row, &self.feature_log_prob[class])
    }
}

impl Classifier for NaiveBayes {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn fit(&mut self, x: &FeatureMatrix, y: &[Label], sample_weight: Option<&[f64]>) -> Result<()> {
        let weights = prepare_fit(Self::NAME, x, y, sample_weight)?;
        let n_features = x.n_features();

        let mut feature_count = [vec![0.0; n_features], vec![0.0; n_features]];
        let mut class_weight = [0.0; 2];
        for ((row, label), w) in x.rows().zip(y).zip(&weights) {
            let class = label.as_i64() as usize;
            class_weight[class] += w;
            for &(j, v) in row {
                feature_count[class][j] += w * v;
            }
        }

        let total_weight: f64 = class_weight.iter().sum();
        for class in 0..2 {
            self.class_log_prior[class] = (class_weight[class] / total_weight).ln();
            let smoothed_total: f64 =
                feature_count[class].iter().sum::<f64>() + self.params.alpha * n_features as f64;
            self.feature_log_prob[class] = feature_count[class]
                .iter()
                .map(|c| ((c + self.params.alpha) / smoothed_total).ln())
                .collect();
        }
        self.fitted = true;
        Ok(())
    }

    fn predict_proba(&self, x: &FeatureMatrix) -> Result<Option<Vec<f64>>> {
        if !self.fitted {
            return Err(not_fitted(Self::NAME));
        }
        Ok(Some(
            x.rows()
                .map(|row| {
                    let diff = self.joint_log_likelihood(row, 1) - self.joint_log_likelihood(row, 0);
                    sigmoid(diff)
                })
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogisticParams {
    /// Inverse L2 regularisation strength
    pub c: f64,
    pub max_iter: usize,
    pub learning_rate: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 200,
            learning_rate: 0.5,
        }
    }
}

/// L2-regularised logistic regression fit by full-batch gradient descent
pub struct LogisticRegression {
    params: LogisticParams,
    coef: Vec<f64>,
    intercept: f64,
    fitted: bool,
}

impl LogisticRegression {
    pub const NAME: &'static str = "logistic";

    pub fn new(params: LogisticParams) -> Result<Self> {
        if params.c <= 0.0 || params.learning_rate <= 0.0 || params.max_iter == 0 {
            return Err(SiftError::config(
                "logistic c, learning_rate and max_iter must be positive",
            ));
        }
        Ok(Self {
            params,
            coef: Vec::new(),
            intercept: 0.0,
            fitted: false,
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(parse_params(Self::NAME, params)?)
    }
}

impl Classifier for LogisticRegression {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn fit(&mut self, x: &FeatureMatrix, y: &[Label], sample_weight: Option<&[f64]>) -> Result<()> {
        let weights = prepare_fit(Self::NAME, x, y, sample_weight)?;
        let n = y.len() as f64;
        self.coef = vec![0.0; x.n_features()];
        self.intercept = 0.0;

        for _ in 0..self.params.max_iter {
            let mut grad = vec![0.0; self.coef.len()];
            let mut grad_intercept = 0.0;
            for ((row, label), w) in x.rows().zip(y).zip(&weights) {
                let p = sigmoid(sparse_dot(row, &self.coef) + self.intercept);
                let err = w * (p - label.as_i64() as f64);
                for &(j, v) in row {
                    grad[j] += err * v;
                }
                grad_intercept += err;
            }
            for (coef, g) in self.coef.iter_mut().zip(&grad) {
                let g = (g + *coef / self.params.c) / n;
                *coef -= self.params.learning_rate * g;
            }
            self.intercept -= self.params.learning_rate * grad_intercept / n;
        }
        self.fitted = true;
        Ok(())
    }

    fn predict_proba(&self, x: &FeatureMatrix) -> Result<Option<Vec<f64>>> {
        if !self.fitted {
            return Err(not_fitted(Self::NAME));
        }
        Ok(Some(
            x.rows()
                .map(|row| sigmoid(sparse_dot(row, &self.coef) + self.intercept))
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinearSvmParams {
    pub c: f64,
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for LinearSvmParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            epochs: 50,
            learning_rate: 0.1,
        }
    }
}

/// Linear SVM trained with hinge-loss SGD. Exposes only a decision function.
pub struct LinearSvm {
    params: LinearSvmParams,
    coef: Vec<f64>,
    intercept: f64,
    fitted: bool,
}

impl LinearSvm {
    pub const NAME: &'static str = "svm";

    pub fn new(params: LinearSvmParams) -> Result<Self> {
        if params.c <= 0.0 || params.learning_rate <= 0.0 || params.epochs == 0 {
            return Err(SiftError::config(
                "svm c, learning_rate and epochs must be positive",
            ));
        }
        Ok(Self {
            params,
            coef: Vec::new(),
            intercept: 0.0,
            fitted: false,
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(parse_params(Self::NAME, params)?)
    }
}

impl Classifier for LinearSvm {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn fit(&mut self, x: &FeatureMatrix, y: &[Label], sample_weight: Option<&[f64]>) -> Result<()> {
        let weights = prepare_fit(Self::NAME, x, y, sample_weight)?;
        let lambda = 1.0 / (self.params.c * y.len() as f64);
        let lr = self.params.learning_rate;
        self.coef = vec![0.0; x.n_features()];
        self.intercept = 0.0;

        for _ in 0..self.params.epochs {
            for ((row, label), w) in x.rows().zip(y).zip(&weights) {
                let target = if label.is_relevant() { 1.0 } else { -1.0 };
                let margin = target * (sparse_dot(row, &self.coef) + self.intercept);
                let shrink = 1.0 - lr * lambda;
                self.coef.iter_mut().for_each(|c| *c *= shrink);
                if margin < 1.0 {
                    for &(j, v) in row {
                        self.coef[j] += lr * w * target * v;
                    }
                    self.intercept += lr * w * target;
                }
            }
        }
        self.fitted = true;
        Ok(())
    }

    fn decision_function(&self, x: &FeatureMatrix) -> Result<Option<Vec<f64>>> {
        if !self.fitted {
            return Err(not_fitted(Self::NAME));
        }
        Ok(Some(
            x.rows()
                .map(|row| sparse_dot(row, &self.coef) + self.intercept)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two separable clusters: relevant rows load on feature 0, irrelevant on feature 1
    fn toy_data() -> (FeatureMatrix, Vec<Label>) {
        let x = FeatureMatrix::from_dense(vec![
            vec![1.0, 0.0, 0.2],
            vec![0.9, 0.1, 0.0],
            vec![0.0, 1.0, 0.1],
            vec![0.1, 0.8, 0.3],
            vec![0.0, 0.9, 0.0],
        ]);
        let y = vec![
            Label::Relevant,
            Label::Relevant,
            Label::Irrelevant,
            Label::Irrelevant,
            Label::Irrelevant,
        ];
        (x, y)
    }

    fn probe() -> FeatureMatrix {
        FeatureMatrix::from_dense(vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]])
    }

    #[test]
    fn test_naive_bayes_separates_classes() {
        let (x, y) = toy_data();
        let mut nb = NaiveBayes::new(NaiveBayesParams { alpha: 0.1 }).unwrap();
        nb.fit(&x, &y, None).unwrap();
        let p = nb.predict_proba(&probe()).unwrap().unwrap();
        assert!(p[0] > 0.5 && p[1] < 0.5, "probabilities were {:?}", p);
        assert!(nb.decision_function(&probe()).unwrap().is_none());
    }

    #[test]
    fn test_logistic_separates_classes() {
        let (x, y) = toy_data();
        let mut lr = LogisticRegression::new(LogisticParams::default()).unwrap();
        lr.fit(&x, &y, None).unwrap();
        let p = lr.predict_proba(&probe()).unwrap().unwrap();
        assert!(p[0] > p[1]);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_svm_exposes_only_decision_function() {
        let (x, y) = toy_data();
        let mut svm = LinearSvm::new(LinearSvmParams::default()).unwrap();
        svm.fit(&x, &y, None).unwrap();
        assert!(svm.predict_proba(&probe()).unwrap().is_none());
        let d = svm.decision_function(&probe()).unwrap().unwrap();
        assert!(d[0] > d[1]);
    }

    #[test]
    fn test_sample_weights_shift_prior() {
        let (x, y) = toy_data();
        let mut unweighted = NaiveBayes::new(NaiveBayesParams::default()).unwrap();
        unweighted.fit(&x, &y, None).unwrap();
        let weights = vec![5.0, 5.0, 1.0, 1.0, 1.0];
        let mut weighted = NaiveBayes::new(NaiveBayesParams::default()).unwrap();
        weighted.fit(&x, &y, Some(&weights)).unwrap();

        let neutral = FeatureMatrix::from_dense(vec![vec![0.0, 0.0, 1.0]]);
        let p_unweighted = unweighted.predict_proba(&neutral).unwrap().unwrap()[0];
        let p_weighted = weighted.predict_proba(&neutral).unwrap().unwrap()[0];
        assert!(p_weighted > p_unweighted);
    }

    #[test]
    fn test_single_class_is_training_error() {
        let x = FeatureMatrix::from_dense(vec![vec![1.0], vec![0.5]]);
        let y = vec![Label::Irrelevant, Label::Irrelevant];
        let mut nb = NaiveBayes::new(NaiveBayesParams::default()).unwrap();
        assert!(matches!(nb.fit(&x, &y, None), Err(SiftError::Training(_))));
    }

    #[test]
    fn test_predict_before_fit_fails() {
        let nb = NaiveBayes::new(NaiveBayesParams::default()).unwrap();
        assert!(nb.predict_proba(&probe()).is_err());
    }

    #[test]
    fn test_shape_mismatch() {
        let (x, _) = toy_data();
        let mut lr = LogisticRegression::new(LogisticParams::default()).unwrap();
        assert!(lr.fit(&x, &[Label::Relevant], None).is_err());
    }
}
