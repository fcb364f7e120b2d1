//! Core data models for the screening engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Screening decision for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Label {
    Irrelevant,
    Relevant,
}

impl Label {
    pub fn is_relevant(self) -> bool {
        matches!(self, Label::Relevant)
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Label::Irrelevant => 0,
            Label::Relevant => 1,
        }
    }
}

impl From<Label> for i64 {
    fn from(label: Label) -> Self {
        label.as_i64()
    }
}

impl TryFrom<i64> for Label {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::Irrelevant),
            1 => Ok(Label::Relevant),
            other => Err(format!("label must be 0 or 1, got {}", other)),
        }
    }
}

impl From<bool> for Label {
    fn from(relevant: bool) -> Self {
        if relevant {
            Label::Relevant
        } else {
            Label::Irrelevant
        }
    }
}

/// An item under review. Content is never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub record_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    /// Ground truth, only present in fully labeled datasets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included: Option<Label>,
}

impl Record {
    pub fn text(&self) -> String {
        match (self.title.is_empty(), self.abstract_text.is_empty()) {
            (false, false) => format!("{} {}", self.title, self.abstract_text),
            (false, true) => self.title.clone(),
            _ => self.abstract_text.clone(),
        }
    }
}

/// Names of the components that produced a ranking
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNames {
    pub classifier: Option<String>,
    pub querier: Option<String>,
    pub balancer: Option<String>,
    pub feature_extractor: Option<String>,
}

impl ModelNames {
    pub fn is_empty(&self) -> bool {
        self.classifier.is_none()
            && self.querier.is_none()
            && self.balancer.is_none()
            && self.feature_extractor.is_none()
    }
}

/// One queried or labeled record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub record_id: i64,
    /// `None` while the record is pending a decision
    pub label: Option<Label>,
    #[serde(flatten)]
    pub models: ModelNames,
    pub training_set: Option<i64>,
    pub time: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub user_id: Option<i64>,
}

impl ResultRow {
    /// A seed label supplied before any model ranking
    pub fn prior(record_id: i64, label: Label) -> Self {
        Self {
            record_id,
            label: Some(label),
            models: ModelNames::default(),
            training_set: None,
            time: Some(Utc::now()),
            note: None,
            tags: None,
            user_id: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.label.is_none()
    }

    pub fn is_prior(&self) -> bool {
        self.label.is_some() && self.models.is_empty()
    }
}

/// One row of the current ranking snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRow {
    pub record_id: i64,
    pub ranking: i64,
    #[serde(flatten)]
    pub models: ModelNames,
    pub training_set: i64,
    pub time: DateTime<Utc>,
}

/// Append-only audit entry for a changed or deleted label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionChange {
    pub record_id: i64,
    pub new_label: Option<Label>,
    pub time: DateTime<Utc>,
}

/// Count labeled rows per class
pub fn label_counts(results: &[ResultRow]) -> (usize, usize) {
    results
        .iter()
        .filter_map(|r| r.label)
        .fold((0, 0), |(rel, irr), label| match label {
            Label::Relevant => (rel + 1, irr),
            Label::Irrelevant => (rel, irr + 1),
        })
}
