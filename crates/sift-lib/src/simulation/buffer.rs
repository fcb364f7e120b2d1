//! In-memory results buffer for a simulation run
//!
//! Rows are appended in labeling order and only reach the project state when
//! the run completes and the buffer is drained into one batch write.

use crate::error::{Result, SiftError};
use crate::models::{label_counts, ResultRow};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ResultsBuffer {
    rows: Vec<ResultRow>,
    record_ids: HashSet<i64>,
}

impl ResultsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            record_ids: HashSet::with_capacity(capacity),
        }
    }

    /// Append one row; a record can only be buffered once
    pub fn push(&mut self, row: ResultRow) -> Result<()> {
        if !self.record_ids.insert(row.record_id) {
            return Err(SiftError::DuplicateRecord(row.record_id));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn push_batch(&mut self, rows: impl IntoIterator<Item = ResultRow>) -> Result<()> {
        for row in rows {
            self.push(row)?;
        }
        Ok(())
    }

    pub fn contains(&self, record_id: i64) -> bool {
        self.record_ids.contains(&record_id)
    }

    /// Buffered rows in labeling order
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Take every buffered row, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<ResultRow> {
        self.record_ids.clear();
        let rows = std::mem::take(&mut self.rows);
        debug!(entries = rows.len(), "Drained results buffer");
        rows
    }

    pub fn stats(&self) -> BufferStats {
        let (relevant, irrelevant) = label_counts(&self.rows);
        BufferStats {
            entries: self.rows.len(),
            relevant,
            irrelevant,
            priors: self.rows.iter().filter(|r| r.is_prior()).count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub entries: usize,
    pub relevant: usize,
    pub irrelevant: usize,
    pub priors: usize,
}
