use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use super::ProgressStore;
use crate::error::StoreError;
use crate::types::{ProgressEntry, RecordStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caption_records (
    id              TEXT PRIMARY KEY,
    status          TEXT NOT NULL CHECK(status IN ('pending', 'in_progress', 'done', 'failed')),
    description     TEXT,
    attempts        INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    run_id          TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_caption_records_status ON caption_records(status);
"#;

const COLUMNS: &str = "id, status, description, attempts, error_message, run_id, updated_at";

/// Open (or create) the progress database. Pass `None` for an in-memory database.
pub fn open_database(path: Option<&Path>) -> Result<Connection, StoreError> {
    let conn = match path {
        Some(p) => Connection::open(p)?,
        None => Connection::open_in_memory()?,
    };

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA busy_timeout = 5000;",
    )?;
    conn.execute_batch(SCHEMA)?;

    Ok(conn)
}

/// Insert or replace the row for `entry.id`.
pub fn upsert_record(conn: &Connection, entry: &ProgressEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO caption_records (id, status, description, attempts, error_message, run_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            description = excluded.description,
            attempts = excluded.attempts,
            error_message = excluded.error_message,
            run_id = excluded.run_id,
            updated_at = excluded.updated_at",
        params![
            entry.id,
            entry.status.as_str(),
            entry.description,
            entry.attempts,
            entry.error,
            entry.run_id,
            entry.updated_at,
        ],
    )?;
    Ok(())
}

/// Flag an item as being worked on, keeping any earlier description.
pub fn mark_in_progress(conn: &Connection, id: &str, run_id: &str) -> Result<(), StoreError> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO caption_records (id, status, attempts, run_id, updated_at)
         VALUES (?1, 'in_progress', 0, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            status = 'in_progress',
            run_id = excluded.run_id,
            updated_at = excluded.updated_at",
        params![id, run_id, now],
    )?;
    Ok(())
}

/// Put back any items that were mid-flight when a previous run died.
/// Returns the number of rows requeued.
pub fn requeue_interrupted(conn: &Connection) -> Result<u32, StoreError> {
    let count = conn.execute(
        "UPDATE caption_records SET status = 'pending' WHERE status = 'in_progress'",
        [],
    )?;
    Ok(count as u32)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(ProgressEntry, String)> {
    let status: String = row.get(1)?;
    Ok((
        ProgressEntry {
            id: row.get(0)?,
            status: RecordStatus::Pending,
            description: row.get(2)?,
            attempts: row.get(3)?,
            error: row.get(4)?,
            run_id: row.get(5)?,
            updated_at: row.get(6)?,
        },
        status,
    ))
}

fn with_status(
    (mut entry, status): (ProgressEntry, String),
    path: &Path,
) -> Result<ProgressEntry, StoreError> {
    entry.status = RecordStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("row {:?} has unknown status {:?}", entry.id, status),
    })?;
    Ok(entry)
}

/// All rows ordered by identifier.
pub fn list_records(conn: &Connection, path: &Path) -> Result<Vec<ProgressEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM caption_records ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([], entry_from_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(with_status(row?, path)?);
    }
    Ok(entries)
}

/// Get a single row by identifier.
pub fn get_record(
    conn: &Connection,
    path: &Path,
    id: &str,
) -> Result<Option<ProgressEntry>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM caption_records WHERE id = ?1"),
            params![id],
            entry_from_row,
        )
        .optional()?;
    row.map(|r| with_status(r, path)).transpose()
}

/// Progress store backed by a SQLite database.
///
/// Unlike the CSV store this one records `in_progress` before each item, so
/// a crash leaves a trace. Those rows are reset to `pending` on open.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let conn = open_database(Some(&path))?;
        Self::from_connection(conn, path)
    }

    /// Open an existing database for reading only. Nothing is created or
    /// requeued, so a run writing to the same file is left alone.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn, path })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = open_database(None)?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        let requeued = requeue_interrupted(&conn)?;
        if requeued > 0 {
            tracing::info!(
                "Requeued {} interrupted item(s) in {}",
                requeued,
                path.display()
            );
        }
        Ok(Self { conn, path })
    }

    pub fn get(&self, id: &str) -> Result<Option<ProgressEntry>, StoreError> {
        get_record(&self.conn, &self.path, id)
    }
}

impl ProgressStore for SqliteStore {
    fn load(&self) -> Result<Vec<ProgressEntry>, StoreError> {
        list_records(&self.conn, &self.path)
    }

    fn record(&mut self, entry: &ProgressEntry) -> Result<(), StoreError> {
        upsert_record(&self.conn, entry)
    }

    fn mark_in_progress(&mut self, id: &str, run_id: &str) -> Result<(), StoreError> {
        mark_in_progress(&self.conn, id, run_id)
    }

    fn location(&self) -> &Path {
        &self.path
    }
}
