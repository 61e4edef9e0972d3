//! Database connection management.
//!
//! [`Store`] wraps a single [`rusqlite::Connection`] behind a mutex and
//! guarantees that migrations run before any other operation. Statements
//! are short and never held across await points, so a plain std mutex is
//! sufficient even from async contexts.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; nothing to salvage.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed-width RFC3339 so lexicographic ordering matches chronological.
pub(crate) fn ts_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_text() -> String {
    ts_text(Utc::now())
}

pub(crate) fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Column helper: parse a TEXT uuid, surfacing conversion errors through
/// rusqlite so `query_row` closures stay small.
pub(crate) fn col_uuid(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<uuid::Uuid> {
    let raw: String = row.get(idx)?;
    uuid::Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn col_ts(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// True when a sqlite error is a UNIQUE constraint violation, which the
/// repositories surface as [`StoreError::Conflict`].
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl StoreError {
    pub(crate) fn conflict_or_sqlite(e: rusqlite::Error, what: &str) -> Self {
        if is_unique_violation(&e) {
            StoreError::Conflict(what.to_string())
        } else {
            StoreError::Sqlite(e)
        }
    }
}
