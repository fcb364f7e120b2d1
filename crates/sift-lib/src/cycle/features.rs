//! Feature extraction for the ranking models
//!
//! Turns record texts into sparse, L2-normalised TF-IDF rows. Extraction is
//! input-deterministic, so callers compute the matrix once per dataset and
//! reuse it across cycles.

use super::{parse_params, FeatureExtractor, Params};
use crate::error::{Result, SiftError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Sparse row-major matrix, each row a list of `(column, value)` sorted by column
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureMatrix {
    rows: Vec<Vec<(usize, f64)>>,
    n_features: usize,
}

impl FeatureMatrix {
    pub fn new(rows: Vec<Vec<(usize, f64)>>, n_features: usize) -> Self {
        Self { rows, n_features }
    }

    /// Build from dense rows, dropping zero entries
    pub fn from_dense(dense: Vec<Vec<f64>>) -> Self {
        let n_features = dense.iter().map(Vec::len).max().unwrap_or(0);
        let rows = dense
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .enumerate()
                    .filter(|(_, v)| *v != 0.0)
                    .collect()
            })
            .collect();
        Self { rows, n_features }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[(usize, f64)]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Rows at the given positions, in the given order
    pub fn select(&self, indices: &[usize]) -> Result<FeatureMatrix> {
        let mut rows = Vec::with_capacity(indices.len());
        for &i in indices {
            let row = self.rows.get(i).ok_or_else(|| {
                SiftError::training(format!(
                    "row {} out of bounds for matrix with {} rows",
                    i,
                    self.rows.len()
                ))
            })?;
            rows.push(row.clone());
        }
        Ok(FeatureMatrix {
            rows,
            n_features: self.n_features,
        })
    }
}

/// Dot product of a sparse row with a dense weight vector
pub fn sparse_dot(row: &[(usize, f64)], weights: &[f64]) -> f64 {
    row.iter()
        .filter_map(|&(j, v)| weights.get(j).map(|w| w * v))
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TfidfParams {
    /// Largest n-gram length (1 or 2)
    pub ngram_max: usize,
    /// Minimum number of documents a term must appear in
    pub min_df: usize,
    /// Use 1 + ln(tf) instead of raw term counts
    pub sublinear_tf: bool,
}

impl Default for TfidfParams {
    fn default() -> Self {
        Self {
            ngram_max: 1,
            min_df: 1,
            sublinear_tf: false,
        }
    }
}

/// TF-IDF extractor with smooth idf and L2 row normalisation
pub struct TfidfExtractor {
    params: TfidfParams,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfidfExtractor {
    pub const NAME: &'static str = "tfidf";

    pub fn new(params: TfidfParams) -> Result<Self> {
        if !(1..=2).contains(&params.ngram_max) {
            return Err(SiftError::config(format!(
                "tfidf ngram_max must be 1 or 2, got {}",
                params.ngram_max
            )));
        }
        if params.min_df == 0 {
            return Err(SiftError::config("tfidf min_df must be at least 1"));
        }
        Ok(Self {
            params,
            vocabulary: HashMap::new(),
            idf: Vec::new(),
        })
    }

    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(parse_params(Self::NAME, params)?)
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }

    fn terms(&self, text: &str) -> Vec<String> {
        let tokens = tokenize(text);
        let mut terms = tokens.clone();
        if self.params.ngram_max >= 2 {
            terms.extend(tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])));
        }
        terms
    }
}

impl FeatureExtractor for TfidfExtractor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or_default()
    }

    fn fit_transform(&mut self, texts: &[String]) -> Result<FeatureMatrix> {
        let documents: Vec<Vec<String>> = texts.iter().map(|t| self.terms(t)).collect();

        // BTreeMap keeps the column order independent of hash seeds
        let mut document_frequency: BTreeMap<&str, usize> = BTreeMap::new();
        for terms in &documents {
            let unique: HashSet<&str> = terms.iter().map(String::as_str).collect();
            for term in unique {
                *document_frequency.entry(term).or_insert(0) += 1;
            }
        }

        let n_docs = documents.len() as f64;
        self.vocabulary.clear();
        self.idf.clear();
        for (term, df) in document_frequency {
            if df < self.params.min_df {
                continue;
            }
            self.vocabulary.insert(term.to_string(), self.idf.len());
            self.idf.push(((1.0 + n_docs) / (1.0 + df as f64)).ln() + 1.0);
        }

        let rows = documents
            .iter()
            .map(|terms| {
                let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
                for term in terms {
                    if let Some(&col) = self.vocabulary.get(term) {
                        *counts.entry(col).or_insert(0.0) += 1.0;
                    }
                }
                let mut row: Vec<(usize, f64)> = counts
                    .into_iter()
                    .map(|(col, tf)| {
                        let tf = if self.params.sublinear_tf {
                            1.0 + tf.ln()
                        } else {
                            tf
                        };
                        (col, tf * self.idf[col])
                    })
                    .collect();
                let norm = row.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
                if norm > f64::EPSILON {
                    row.iter_mut().for_each(|(_, v)| *v /= norm);
                }
                row
            })
            .collect();

        Ok(FeatureMatrix::new(rows, self.idf.len()))
    }
}

/// Lowercase alphanumeric tokens
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Deep-Learning, for 2 NETS!"), vec!["deep", "learning", "for", "2", "nets"]);
        assert!(tokenize("  ,,, ").is_empty());
    }

    #[test]
    fn test_rows_are_l2_normalised() {
        let mut extractor = TfidfExtractor::new(TfidfParams::default()).unwrap();
        let x = extractor
            .fit_transform(&texts(&["cats and dogs", "dogs bark", "cats purr loudly"]))
            .unwrap();
        assert_eq!(x.n_rows(), 3);
        for row in x.rows() {
            let norm: f64 = row.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rare_terms_weigh_more() {
        let mut extractor = TfidfExtractor::new(TfidfParams::default()).unwrap();
        let x = extractor
            .fit_transform(&texts(&["common rare", "common", "common"]))
            .unwrap();
        let common = extractor.vocabulary["common"];
        let rare = extractor.vocabulary["rare"];
        let row: HashMap<usize, f64> = x.row(0).iter().copied().collect();
        assert!(row[&rare] > row[&common]);
    }

    #[test]
    fn test_min_df_and_bigrams() {
        let params = TfidfParams {
            ngram_max: 2,
            min_df: 2,
            sublinear_tf: false,
        };
        let mut extractor = TfidfExtractor::new(params).unwrap();
        extractor
            .fit_transform(&texts(&["machine learning model", "machine learning", "other"]))
            .unwrap();
        assert!(extractor.vocabulary.contains_key("machine learning"));
        assert!(!extractor.vocabulary.contains_key("model"));
        assert_eq!(extractor.vocabulary_size(), 3);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = TfidfParams {
            ngram_max: 3,
            ..Default::default()
        };
        assert!(matches!(TfidfExtractor::new(params), Err(SiftError::Config(_))));

        let mut raw = Params::new();
        raw.insert("stop_words".into(), serde_json::json!("english"));
        assert!(matches!(
            TfidfExtractor::from_params(&raw),
            Err(SiftError::Config(_))
        ));
    }

    #[test]
    fn test_empty_text_gives_empty_row() {
        let mut extractor = TfidfExtractor::new(TfidfParams::default()).unwrap();
        let x = extractor.fit_transform(&texts(&["", "words here"])).unwrap();
        assert!(x.row(0).is_empty());
    }

    #[test]
    fn test_select_and_dot() {
        let x = FeatureMatrix::from_dense(vec![vec![1.0, 0.0], vec![0.0, 2.0], vec![3.0, 1.0]]);
        let sub = x.select(&[2, 0]).unwrap();
        assert_eq!(sub.n_rows(), 2);
        assert_eq!(sparse_dot(sub.row(0), &[1.0, 1.0]), 4.0);
        assert!(x.select(&[5]).is_err());
    }
}
