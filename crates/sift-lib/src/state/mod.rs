//! Durable ledger of labeling decisions for one project
//!
//! Three tables live in one SQLite file:
//! - `results`: one row per queried or labeled record, in insertion order
//! - `last_ranking`: the current ranking snapshot of unlabeled records
//! - `decision_changes`: append-only audit of changed or deleted labels
//!
//! Every mutation runs in a single transaction and rolls back in full on error.
//! When a ranked record receives a label its snapshot row is dropped and the
//! rows behind it move up, so the snapshot stays dense and never contains a
//! labeled record.

mod schema;

#[cfg(test)]
mod tests;

pub(crate) use schema::apply_pragmas;

use crate::error::{Result, SiftError};
use crate::models::{DecisionChange, Label, ModelNames, RankingRow, ResultRow};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use schema::{create_schema, from_micros, now, to_micros};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

const RESULT_COLUMNS: &str = "record_id, label, classifier, querier, balancer, feature_extractor, \
                              training_set, time, note, tags, user_id";

const RANKING_COLUMNS: &str =
    "record_id, ranking, classifier, querier, balancer, feature_extractor, training_set, time";

pub struct State {
    conn: Connection,
}

impl State {
    /// Open (or create) a state file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        create_schema(&conn)?;
        debug!(path = %path.display(), "Opened project state");
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self { conn })
    }

    // --- labeling -------------------------------------------------------

    /// Upsert labels for a batch of records.
    ///
    /// `tags`, when given, must have one entry per record. Overwriting a
    /// stored label with a different value is recorded as a decision change.
    pub fn add_labeling_data(
        &mut self,
        record_ids: &[i64],
        labels: &[Label],
        tags: Option<&[Option<serde_json::Value>]>,
        user_id: Option<i64>,
    ) -> Result<()> {
        let n_tags = tags.map(|t| t.len()).unwrap_or(record_ids.len());
        if labels.len() != record_ids.len() || n_tags != record_ids.len() {
            return Err(SiftError::LengthMismatch {
                record_ids: record_ids.len(),
                labels: labels.len(),
                tags: n_tags,
            });
        }

        let time = now();
        let rows: Vec<ResultRow> = record_ids
            .iter()
            .zip(labels)
            .enumerate()
            .map(|(i, (&record_id, &label))| ResultRow {
                record_id,
                label: Some(label),
                models: ModelNames::default(),
                training_set: None,
                time: Some(time),
                note: None,
                tags: tags.and_then(|t| t[i].clone()),
                user_id,
            })
            .collect();

        self.upsert(&rows)?;
        debug!(n = rows.len(), user_id = ?user_id, "Stored labeling data");
        Ok(())
    }

    /// Batch upsert of complete result rows, used when flushing a simulation.
    pub fn write_results(&mut self, rows: &[ResultRow]) -> Result<()> {
        self.upsert(rows)?;
        info!(n = rows.len(), "Wrote results batch");
        Ok(())
    }

    fn upsert(&mut self, rows: &[ResultRow]) -> Result<()> {
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            if !seen.insert(row.record_id) {
                return Err(SiftError::DuplicateRecord(row.record_id));
            }
        }

        let tx = self.conn.transaction()?;
        for row in rows {
            let previous: Option<Option<i64>> = tx
                .query_row(
                    "SELECT label FROM results WHERE record_id = ?1",
                    [row.record_id],
                    |r| r.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO results (record_id, label, classifier, querier, balancer,
                     feature_extractor, training_set, time, note, tags, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(record_id) DO UPDATE SET
                     label = excluded.label,
                     classifier = COALESCE(excluded.classifier, results.classifier),
                     querier = COALESCE(excluded.querier, results.querier),
                     balancer = COALESCE(excluded.balancer, results.balancer),
                     feature_extractor = COALESCE(excluded.feature_extractor, results.feature_extractor),
                     training_set = COALESCE(excluded.training_set, results.training_set),
                     time = COALESCE(excluded.time, results.time),
                     note = COALESCE(excluded.note, results.note),
                     tags = COALESCE(excluded.tags, results.tags),
                     user_id = COALESCE(excluded.user_id, results.user_id)",
                params![
                    row.record_id,
                    row.label.map(Label::as_i64),
                    row.models.classifier,
                    row.models.querier,
                    row.models.balancer,
                    row.models.feature_extractor,
                    row.training_set,
                    row.time.as_ref().map(to_micros),
                    row.note,
                    encode_tags(row.tags.as_ref())?,
                    row.user_id,
                ],
            )?;

            let changed = matches!(
                (previous.flatten(), row.label),
                (Some(old), Some(new)) if old != new.as_i64()
            );
            if changed {
                append_decision_change(&tx, row.record_id, row.label, row.time.unwrap_or_else(now))?;
            }
            if row.label.is_some() {
                drop_from_ranking(&tx, row.record_id)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Change the label and tags of an existing row; always audited
    pub fn update(
        &mut self,
        record_id: i64,
        label: Option<Label>,
        tags: Option<serde_json::Value>,
    ) -> Result<()> {
        let time = now();
        let tx = self.conn.transaction()?;
        let n = tx.execute(
            "UPDATE results SET label = ?2, tags = COALESCE(?3, tags), time = ?4
             WHERE record_id = ?1",
            params![
                record_id,
                label.map(Label::as_i64),
                encode_tags(tags.as_ref())?,
                to_micros(&time)
            ],
        )?;
        if n == 0 {
            return Err(SiftError::RecordNotFound(record_id));
        }
        append_decision_change(&tx, record_id, label, time)?;
        if label.is_some() {
            drop_from_ranking(&tx, record_id)?;
        }
        tx.commit()?;
        debug!(record_id, label = ?label, "Updated label");
        Ok(())
    }

    pub fn update_note(&mut self, record_id: i64, note: Option<&str>) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE results SET note = ?2 WHERE record_id = ?1",
            params![record_id, note],
        )?;
        if n == 0 {
            return Err(SiftError::RecordNotFound(record_id));
        }
        Ok(())
    }

    /// Remove a record's labeling data and put it back into the pool
    pub fn delete_record_labeling_data(&mut self, record_id: i64) -> Result<()> {
        let time = now();
        let tx = self.conn.transaction()?;
        let n = tx.execute("DELETE FROM results WHERE record_id = ?1", [record_id])?;
        if n == 0 {
            return Err(SiftError::RecordNotFound(record_id));
        }
        append_decision_change(&tx, record_id, None, time)?;

        // Back of the current snapshot, attributed to no model
        tx.execute(
            "INSERT INTO last_ranking (record_id, ranking, classifier, querier, balancer,
                 feature_extractor, training_set, time)
             SELECT ?1, next_ranking, NULL, NULL, NULL, NULL, training_set, time
             FROM (
                 SELECT COALESCE(MAX(ranking) + 1, 0) AS next_ranking,
                        COALESCE(MAX(training_set), 0) AS training_set,
                        COALESCE(MAX(time), ?2) AS time
                 FROM last_ranking
             )
             WHERE NOT EXISTS (SELECT 1 FROM last_ranking WHERE record_id = ?1)",
            params![record_id, to_micros(&time)],
        )?;
        tx.commit()?;
        info!(record_id, "Deleted labeling data");
        Ok(())
    }

    // --- ranking --------------------------------------------------------

    /// Replace the ranking snapshot in full.
    ///
    /// Records already in `results` are skipped; duplicates keep their first
    /// position. Ranks are dense from 0 in input order.
    pub fn add_last_ranking(
        &mut self,
        ranked_record_ids: &[i64],
        models: &ModelNames,
        training_set: i64,
    ) -> Result<()> {
        let time = to_micros(&now());
        let tx = self.conn.transaction()?;
        let excluded: HashSet<i64> = {
            let mut stmt = tx.prepare("SELECT record_id FROM results")?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<HashSet<i64>>>()?;
            ids
        };

        tx.execute("DELETE FROM last_ranking", [])?;
        let mut written = 0i64;
        {
            let mut seen = HashSet::with_capacity(ranked_record_ids.len());
            let mut insert = tx.prepare(
                "INSERT INTO last_ranking (record_id, ranking, classifier, querier, balancer,
                     feature_extractor, training_set, time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for &record_id in ranked_record_ids {
                if excluded.contains(&record_id) || !seen.insert(record_id) {
                    continue;
                }
                insert.execute(params![
                    record_id,
                    written,
                    models.classifier,
                    models.querier,
                    models.balancer,
                    models.feature_extractor,
                    training_set,
                    time,
                ])?;
                written += 1;
            }
        }
        tx.commit()?;
        debug!(n_ranked = written, training_set, "Replaced ranking snapshot");
        Ok(())
    }

    /// Move the `n` best pool records into results as pending rows.
    pub fn query_top_ranked(&mut self, n: usize, user_id: Option<i64>) -> Result<Vec<i64>> {
        let time = to_micros(&now());
        let tx = self.conn.transaction()?;
        let top: Vec<RankingRow> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM last_ranking
                 WHERE record_id NOT IN (SELECT record_id FROM results)
                 ORDER BY ranking LIMIT ?1",
                RANKING_COLUMNS
            ))?;
            let rows = stmt
                .query_map([n as i64], ranking_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        if top.len() < n {
            return Err(SiftError::PoolExhausted {
                requested: n,
                available: top.len(),
            });
        }

        for row in &top {
            tx.execute(
                "INSERT INTO results (record_id, label, classifier, querier, balancer,
                     feature_extractor, training_set, time, user_id)
                 VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.record_id,
                    row.models.classifier,
                    row.models.querier,
                    row.models.balancer,
                    row.models.feature_extractor,
                    row.training_set,
                    time,
                    user_id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(top.into_iter().map(|r| r.record_id).collect())
    }

    /// Unlabeled, not-pending record ids in ranking order
    pub fn get_pool(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id FROM last_ranking
             WHERE record_id NOT IN (SELECT record_id FROM results)
             ORDER BY ranking",
        )?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn get_last_ranking_table(&self) -> Result<Vec<RankingRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM last_ranking ORDER BY ranking",
            RANKING_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], ranking_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Whether labels changed since the current snapshot was trained.
    ///
    /// True when labels exist but no snapshot does, when more records are
    /// labeled than the snapshot was trained on, or when a label changed or
    /// was deleted at or after the snapshot time.
    pub fn exist_new_labeled_records(&self) -> Result<bool> {
        let n_labeled = self.n_labeled()? as i64;
        let (training_set, snapshot_time): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MAX(training_set), MAX(time) FROM last_ranking",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let (Some(training_set), Some(snapshot_time)) = (training_set, snapshot_time) else {
            return Ok(n_labeled > 0);
        };
        if n_labeled > training_set {
            return Ok(true);
        }
        let changed: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM decision_changes WHERE time >= ?1)",
            [snapshot_time],
            |r| r.get(0),
        )?;
        Ok(changed)
    }

    // --- reads ----------------------------------------------------------

    /// All result rows in insertion order
    pub fn get_results_table(&self) -> Result<Vec<ResultRow>> {
        self.select_results("1 = 1", [])
    }

    pub fn get_results_record(&self, record_id: i64) -> Result<ResultRow> {
        self.select_results("record_id = ?1", [record_id])?
            .pop()
            .ok_or(SiftError::RecordNotFound(record_id))
    }

    pub fn get_labeled(&self) -> Result<Vec<ResultRow>> {
        self.select_results("label IS NOT NULL", [])
    }

    pub fn get_priors(&self) -> Result<Vec<ResultRow>> {
        self.select_results(
            "label IS NOT NULL AND classifier IS NULL AND querier IS NULL \
             AND balancer IS NULL AND feature_extractor IS NULL",
            [],
        )
    }

    /// Pending rows, optionally only those assigned to one user
    pub fn get_pending(&self, user_id: Option<i64>) -> Result<Vec<ResultRow>> {
        match user_id {
            Some(user_id) => self.select_results("label IS NULL AND user_id = ?1", [user_id]),
            None => self.select_results("label IS NULL", []),
        }
    }

    pub fn get_decision_changes(&self) -> Result<Vec<DecisionChange>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_id, new_label, time FROM decision_changes ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(DecisionChange {
                    record_id: r.get(0)?,
                    new_label: label_column(r, 1)?,
                    time: from_micros(2, r.get(2)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn n_labeled(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM results WHERE label IS NOT NULL")
    }

    pub fn n_pending(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM results WHERE label IS NULL")
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(sql, [], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn select_results<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<ResultRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM results WHERE {} ORDER BY id",
            RESULT_COLUMNS, filter
        ))?;
        let rows = stmt
            .query_map(params, result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn append_decision_change(
    conn: &Connection,
    record_id: i64,
    new_label: Option<Label>,
    time: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO decision_changes (record_id, new_label, time) VALUES (?1, ?2, ?3)",
        params![record_id, new_label.map(Label::as_i64), to_micros(&time)],
    )?;
    Ok(())
}

/// Remove a record from the snapshot and close the gap it leaves.
fn drop_from_ranking(conn: &Connection, record_id: i64) -> rusqlite::Result<()> {
    let ranking: Option<i64> = conn
        .query_row(
            "SELECT ranking FROM last_ranking WHERE record_id = ?1",
            [record_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(ranking) = ranking {
        conn.execute("DELETE FROM last_ranking WHERE record_id = ?1", [record_id])?;
        conn.execute(
            "UPDATE last_ranking SET ranking = ranking - 1 WHERE ranking > ?1",
            [ranking],
        )?;
    }
    Ok(())
}

fn encode_tags(tags: Option<&serde_json::Value>) -> Result<Option<String>> {
    Ok(tags.map(serde_json::to_string).transpose()?)
}

fn label_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Label>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|v| Label::try_from(v).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, v)))
        .transpose()
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ResultRow> {
    let tags = row
        .get::<_, Option<String>>(9)?
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))
        })
        .transpose()?;

    Ok(ResultRow {
        record_id: row.get(0)?,
        label: label_column(row, 1)?,
        models: ModelNames {
            classifier: row.get(2)?,
            querier: row.get(3)?,
            balancer: row.get(4)?,
            feature_extractor: row.get(5)?,
        },
        training_set: row.get(6)?,
        time: row
            .get::<_, Option<i64>>(7)?
            .map(|v| from_micros(7, v))
            .transpose()?,
        note: row.get(8)?,
        tags,
        user_id: row.get(10)?,
    })
}

fn ranking_from_row(row: &Row<'_>) -> rusqlite::Result<RankingRow> {
    Ok(RankingRow {
        record_id: row.get(0)?,
        ranking: row.get(1)?,
        models: ModelNames {
            classifier: row.get(2)?,
            querier: row.get(3)?,
            balancer: row.get(4)?,
            feature_extractor: row.get(5)?,
        },
        training_set: row.get(6)?,
        time: from_micros(7, row.get(7)?)?,
    })
}
