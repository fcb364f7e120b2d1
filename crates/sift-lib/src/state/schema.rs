//! SQLite schema and connection pragmas for project state

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

/// Pragmas applied to every connection we open.
pub(crate) fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA foreign_keys = ON;
        ",
    )
}

pub(crate) fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL UNIQUE,
            label INTEGER CHECK (label IN (0, 1)),
            classifier TEXT,
            querier TEXT,
            balancer TEXT,
            feature_extractor TEXT,
            training_set INTEGER,
            time INTEGER,
            note TEXT,
            tags TEXT,
            user_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS last_ranking (
            record_id INTEGER PRIMARY KEY,
            ranking INTEGER NOT NULL,
            classifier TEXT,
            querier TEXT,
            balancer TEXT,
            feature_extractor TEXT,
            training_set INTEGER NOT NULL,
            time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_last_ranking_ranking ON last_ranking (ranking);

        CREATE TABLE IF NOT EXISTS decision_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL,
            new_label INTEGER CHECK (new_label IN (0, 1)),
            time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_decision_changes_time ON decision_changes (time);
        ",
    )
}

/// Times are stored as microseconds since the epoch.
pub(crate) fn to_micros(time: &DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

pub(crate) fn from_micros(column: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, micros))
}

/// Current time truncated to the stored precision
pub(crate) fn now() -> DateTime<Utc> {
    let micros = Utc::now().timestamp_micros();
    Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
}
