//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The orchestrator and panel sources call store methods; they never
//! execute SQL directly.

mod analysis;
mod panel;

pub use panel::SqlitePanelSource;

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::time::Duration;

pub struct AnalysisStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl AnalysisStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        // Workers share the file; wait for the write lock instead of failing.
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> EngineResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_analysis.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_panel_observation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_artifact.sql"))?;
        Ok(())
    }
}

/// Fixed-width UTC timestamps, so text order is time order.
pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Other(anyhow::anyhow!("bad timestamp '{raw}': {e}")))
}
