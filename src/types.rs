use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-image lifecycle: Pending -> InProgress -> Done/Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::InProgress => "in_progress",
            RecordStatus::Done => "done",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "in_progress" => Some(RecordStatus::InProgress),
            "done" => Some(RecordStatus::Done),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image discovered in the input directory or manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Stable key used in the progress store.
    pub id: String,
    /// Where to read the image bytes from.
    pub path: PathBuf,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Raw image bytes plus the mime type the endpoint needs.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

impl ImagePayload {
    pub fn base64(&self) -> String {
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &self.bytes)
    }
}

/// One row of the progress store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub id: String,
    pub status: RecordStatus,
    pub description: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    pub run_id: String,
    /// RFC 3339, UTC.
    pub updated_at: String,
}

impl ProgressEntry {
    /// A successfully captioned image.
    pub fn done(id: &str, description: String, attempts: u32, run_id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: RecordStatus::Done,
            description: Some(description),
            attempts,
            error: None,
            run_id: run_id.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// An image that exhausted its retries or hit a permanent error.
    pub fn failed(id: &str, error: String, attempts: u32, run_id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: RecordStatus::Failed,
            description: None,
            attempts,
            error: Some(error),
            run_id: run_id.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == RecordStatus::Done
    }
}

/// Counts reported at the end of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: String,
    /// Images found in the input.
    pub discovered: usize,
    /// Already `done` in the store before this run.
    pub skipped: usize,
    pub done: usize,
    pub failed: usize,
    /// Left pending because the run was cancelled.
    pub not_attempted: usize,
    /// Total calls made to the captioning endpoint.
    pub api_calls: u32,
    pub failed_ids: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}
