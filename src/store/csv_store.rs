use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use tempfile::NamedTempFile;

use super::ProgressStore;
use crate::error::StoreError;
use crate::parser::collapse_whitespace;
use crate::types::{ProgressEntry, RecordStatus};

/// Column layout of the results file.
pub const HEADER: [&str; 7] = [
    "file_path",
    "status",
    "reverse_prompt",
    "attempts",
    "error",
    "run_id",
    "updated_at",
];

/// Row-oriented progress store backed by a CSV file.
///
/// Every record occupies exactly one newline-terminated line. New
/// identifiers are appended and `fsync`ed; replacing an existing identifier
/// rewrites the file through a temp file and an atomic rename. A final line
/// without its terminator that does not hold a complete row comes from an
/// interrupted append, so [`CsvStore::open`] drops it and truncates the file
/// back to the last complete record. A complete but unterminated row is kept
/// and the file is rewritten with its newline.
#[derive(Debug)]
pub struct CsvStore {
    path: PathBuf,
    entries: BTreeMap<String, ProgressEntry>,
}

struct Scan {
    entries: BTreeMap<String, ProgressEntry>,
    truncate_at: Option<u64>,
    needs_rewrite: bool,
}

impl CsvStore {
    /// Open (or create) the results file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self {
            path: path.into(),
            entries: BTreeMap::new(),
        };

        if let Some(parent) = store.parent_dir() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let bytes = match fs::read(&store.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::io(&store.path, e)),
        };

        if bytes.is_empty() {
            store.rewrite()?;
            return Ok(store);
        }

        let scan = scan(&store.path, &bytes)?;
        store.entries = scan.entries;

        if let Some(offset) = scan.truncate_at {
            tracing::warn!(
                "Discarding incomplete trailing record in {} (offset {})",
                store.path.display(),
                offset
            );
            store.truncate(offset)?;
        }
        if scan.needs_rewrite {
            store.rewrite()?;
        }

        Ok(store)
    }

    /// Read the entries at `path` without modifying the file.
    ///
    /// An incomplete trailing append is skipped in memory only, so this is
    /// safe while another process is still writing the store.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<ProgressEntry>, StoreError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
        let scan = scan(path, &bytes)?;
        Ok(scan.entries.into_values().collect())
    }

    pub fn get(&self, id: &str) -> Option<&ProgressEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    fn encode(&self, entry: &ProgressEntry) -> Result<Vec<u8>, StoreError> {
        let mut wtr = writer(Vec::new());
        wtr.write_record(row_fields(entry))?;
        wtr.into_inner()
            .map_err(|e| StoreError::io(&self.path, e.into_error()))
    }

    fn append(&self, entry: &ProgressEntry) -> Result<(), StoreError> {
        let row = self.encode(entry)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(&row)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_data()
            .map_err(|e| StoreError::io(&self.path, e))
    }

    fn rewrite(&self) -> Result<(), StoreError> {
        let dir = self.parent_dir().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;

        {
            let mut wtr = writer(tmp.as_file_mut());
            wtr.write_record(HEADER)?;
            for entry in self.entries.values() {
                wtr.write_record(row_fields(entry))?;
            }
            wtr.flush().map_err(|e| StoreError::io(&self.path, e))?;
        }

        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path, e.error))?;
        Ok(())
    }

    fn truncate(&self, offset: u64) -> Result<(), StoreError> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.set_len(offset)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_all()
            .map_err(|e| StoreError::io(&self.path, e))
    }
}

impl ProgressStore for CsvStore {
    fn load(&self) -> Result<Vec<ProgressEntry>, StoreError> {
        Ok(self.entries.values().cloned().collect())
    }

    fn record(&mut self, entry: &ProgressEntry) -> Result<(), StoreError> {
        let mut entry = entry.clone();
        entry.description = entry.description.map(|d| collapse_whitespace(&d));
        entry.error = entry.error.map(|e| collapse_whitespace(&e));

        let replacing = self.entries.contains_key(&entry.id);
        if replacing {
            let previous = self.entries.insert(entry.id.clone(), entry);
            if let Err(e) = self.rewrite() {
                // Keep memory in line with what is on disk.
                if let Some(prev) = previous {
                    self.entries.insert(prev.id.clone(), prev);
                }
                return Err(e);
            }
        } else {
            self.append(&entry)?;
            self.entries.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

fn writer<W: Write>(inner: W) -> csv::Writer<W> {
    WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_writer(inner)
}

fn row_fields(entry: &ProgressEntry) -> [String; 7] {
    [
        entry.id.clone(),
        entry.status.as_str().to_string(),
        entry.description.clone().unwrap_or_default(),
        entry.attempts.to_string(),
        entry.error.clone().unwrap_or_default(),
        entry.run_id.clone(),
        entry.updated_at.clone(),
    ]
}

fn non_empty(field: &str) -> Option<String> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

fn parse_row(rec: &StringRecord) -> Result<ProgressEntry, String> {
    if rec.len() != HEADER.len() {
        return Err(format!(
            "expected {} fields, found {}",
            HEADER.len(),
            rec.len()
        ));
    }
    if rec[0].is_empty() {
        return Err("empty file_path".to_string());
    }
    let status =
        RecordStatus::parse(&rec[1]).ok_or_else(|| format!("unknown status {:?}", &rec[1]))?;
    let attempts = rec[3]
        .parse::<u32>()
        .map_err(|_| format!("invalid attempts {:?}", &rec[3]))?;

    Ok(ProgressEntry {
        id: rec[0].to_string(),
        status,
        description: non_empty(&rec[2]),
        attempts,
        error: non_empty(&rec[4]),
        run_id: rec[5].to_string(),
        updated_at: rec[6].to_string(),
    })
}

fn scan(path: &Path, bytes: &[u8]) -> Result<Scan, StoreError> {
    let torn = !bytes.ends_with(b"\n");

    // Blank file, or a crash while the header itself was being written.
    let blank = bytes.iter().all(u8::is_ascii_whitespace);
    if blank || (!bytes.contains(&b'\n') && HEADER.join(",").as_bytes().starts_with(bytes)) {
        return Ok(Scan {
            entries: BTreeMap::new(),
            truncate_at: None,
            needs_rewrite: true,
        });
    }

    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut record = StringRecord::new();

    rdr.read_record(&mut record)?;
    if !record.iter().eq(HEADER.iter().copied()) {
        return Err(StoreError::Schema {
            path: path.to_path_buf(),
            found: record.iter().collect::<Vec<_>>().join(","),
        });
    }

    let mut rows = Vec::new();
    let mut truncate_at = None;
    loop {
        let pos = rdr.position().clone();
        match rdr.read_record(&mut record) {
            Ok(true) => rows.push((pos, record.clone())),
            Ok(false) => break,
            Err(e) => {
                let rest = &bytes[pos.byte() as usize..];
                if torn && !rest.contains(&b'\n') {
                    truncate_at = Some(pos.byte());
                    break;
                }
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line: pos.line(),
                    reason: e.to_string(),
                });
            }
        }
    }

    // Without its terminator the last line is an interrupted append, unless
    // it already holds a complete row. That happens when an editor drops the
    // final newline.
    let mut unterminated = false;
    if torn && truncate_at.is_none() {
        let complete = rows
            .last()
            .map(|(_, rec)| rec.len() >= HEADER.len() && parse_row(rec).is_ok());
        match complete {
            Some(true) => unterminated = true,
            Some(false) => truncate_at = rows.pop().map(|(pos, _)| pos.byte()),
            None => {}
        }
    }

    let mut entries = BTreeMap::new();
    let mut duplicates = 0;
    for (pos, rec) in rows {
        let entry = parse_row(&rec).map_err(|reason| StoreError::Corrupt {
            path: path.to_path_buf(),
            line: pos.line(),
            reason,
        })?;
        if entries.insert(entry.id.clone(), entry).is_some() {
            duplicates += 1;
        }
    }

    if duplicates > 0 {
        tracing::warn!(
            "Collapsing {} duplicate identifier(s) in {}",
            duplicates,
            path.display()
        );
    }

    Ok(Scan {
        entries,
        truncate_at,
        needs_rewrite: duplicates > 0 || unterminated,
    })
}
