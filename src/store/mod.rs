//! Durable progress stores.
//!
//! A store maps image identifiers to their latest [`ProgressEntry`]. It is
//! read once at startup to compute the resume set and written after every
//! item. Stores never hold two entries for the same identifier and never
//! delete entries.

pub mod csv_store;
pub mod sqlite;

pub use csv_store::CsvStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::StoreError;
use crate::types::{ProgressEntry, RecordStatus};

/// Persistence backend for batch progress.
pub trait ProgressStore {
    /// All entries, sorted by identifier.
    fn load(&self) -> Result<Vec<ProgressEntry>, StoreError>;

    /// Insert or replace the entry for `entry.id`. Must be durable on return.
    fn record(&mut self, entry: &ProgressEntry) -> Result<(), StoreError>;

    /// Note that an item is being worked on. Backends that cannot update
    /// in place cheaply may ignore this.
    fn mark_in_progress(&mut self, _id: &str, _run_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    /// Where the store lives, for logs.
    fn location(&self) -> &Path;
}

/// Open the store matching the file extension: SQLite for `.db`, `.sqlite`
/// and `.sqlite3`, CSV for everything else.
pub fn open_store(path: &Path) -> Result<Box<dyn ProgressStore>, StoreError> {
    if is_sqlite(path) {
        Ok(Box::new(SqliteStore::open(path)?))
    } else {
        Ok(Box::new(CsvStore::open(path)?))
    }
}

/// Load every entry from an existing store without modifying it: no
/// truncation, compaction or requeueing.
pub fn read_store(path: &Path) -> Result<Vec<ProgressEntry>, StoreError> {
    if is_sqlite(path) {
        SqliteStore::open_read_only(path)?.load()
    } else {
        CsvStore::read(path)
    }
}

fn is_sqlite(path: &Path) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "db" | "sqlite" | "sqlite3")
}

/// Count entries per status.
pub fn count_by_status(entries: &[ProgressEntry]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for status in [
        RecordStatus::Pending,
        RecordStatus::InProgress,
        RecordStatus::Done,
        RecordStatus::Failed,
    ] {
        counts.insert(status.as_str(), 0);
    }
    for entry in entries {
        *counts.entry(entry.status.as_str()).or_insert(0) += 1;
    }
    counts
}
