//! Error taxonomy shared by the cycle, state, simulation and scheduler

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SiftError>;

#[derive(Debug, Error)]
pub enum SiftError {
    /// Unknown component name or malformed cycle descriptor
    #[error("configuration error: {0}")]
    Config(String),

    /// Classifier exposes neither predict_proba nor decision_function
    #[error("classifier '{0}' exposes neither predict_proba nor decision_function")]
    Capability(String),

    #[error("batch length mismatch: {record_ids} record ids, {labels} labels, {tags} tags")]
    LengthMismatch {
        record_ids: usize,
        labels: usize,
        tags: usize,
    },

    #[error("record {0} appears more than once in one batch")]
    DuplicateRecord(i64),

    #[error("record {0} has no labeling data")]
    RecordNotFound(i64),

    #[error("pool exhausted: requested {requested} records, {available} available")]
    PoolExhausted { requested: usize, available: usize },

    /// Failure while fitting, ranking or transforming
    #[error("training error: {0}")]
    Training(String),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SiftError {
    /// Taxonomy bucket, recorded alongside failed jobs
    pub fn category(&self) -> &'static str {
        match self {
            SiftError::Config(_) => "configuration",
            SiftError::Capability(_) => "capability",
            SiftError::LengthMismatch { .. }
            | SiftError::DuplicateRecord(_)
            | SiftError::RecordNotFound(_)
            | SiftError::PoolExhausted { .. } => "data_integrity",
            SiftError::Training(_) => "training",
            SiftError::Scheduling(_) | SiftError::Protocol(_) => "scheduling",
            SiftError::Storage(_) | SiftError::Io(_) | SiftError::Json(_) => "runtime",
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SiftError::Config(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        SiftError::Training(msg.into())
    }
}
