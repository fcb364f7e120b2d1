//! Durable FIFO of waiting jobs, unique per project

use crate::error::Result;
use crate::state::apply_pragmas;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub project_id: String,
    pub simulation: bool,
    pub created_at: DateTime<Utc>,
}

pub struct WaitingQueue {
    conn: Connection,
}

impl WaitingQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS waiting (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL UNIQUE,
                simulation INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// Returns false when the project was already waiting
    pub fn insert(&self, project_id: &str, simulation: bool) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO waiting (project_id, simulation, created_at) VALUES (?1, ?2, ?3)",
            params![project_id, simulation, Utc::now().timestamp_micros()],
        )?;
        Ok(n == 1)
    }

    /// Entries oldest first
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT project_id, simulation, created_at FROM waiting ORDER BY id")?;
        let entries = stmt
            .query_map([], |row| {
                let micros: i64 = row.get(2)?;
                Ok(QueueEntry {
                    project_id: row.get(0)?,
                    simulation: row.get(1)?,
                    created_at: Utc
                        .timestamp_micros(micros)
                        .single()
                        .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, micros))?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn delete(&self, project_id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM waiting WHERE project_id = ?1", [project_id])?;
        Ok(n == 1)
    }

    pub fn contains(&self, project_id: &str) -> Result<bool> {
        let found: bool = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM waiting WHERE project_id = ?1)",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM waiting", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
