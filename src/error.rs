use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Whether a captioning failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limits, timeouts, server errors. Retried with backoff.
    Transient,
    /// Bad input, auth failures, blocked content. Recorded without retry.
    Permanent,
}

/// Errors returned by a captioning backend for a single image.
#[derive(Error, Debug)]
pub enum CaptionError {
    /// The request never produced an HTTP response.
    #[error("Cannot connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        source: reqwest::Error,
    },

    /// The call did not finish within the per-call budget.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint returned a non-success HTTP status.
    #[error("Endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A success status with a body we could not interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to read image {path}: {source}")]
    ImageRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unsupported image type: {0}")]
    UnsupportedImage(String),

    /// The model refused to describe the image.
    #[error("Content blocked: {0}")]
    Blocked(String),

    #[error("Model returned an empty caption")]
    EmptyCaption,
}

impl CaptionError {
    /// Classify this error for the retry loop.
    pub fn kind(&self) -> FailureKind {
        match self {
            CaptionError::Connection { .. }
            | CaptionError::Timeout(_)
            | CaptionError::InvalidResponse(_) => FailureKind::Transient,
            CaptionError::Http { status, .. } => classify_status(*status),
            CaptionError::ImageRead { .. }
            | CaptionError::UnsupportedImage(_)
            | CaptionError::Blocked(_)
            | CaptionError::EmptyCaption => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

/// Map an HTTP status to a failure kind: 408, 429 and 5xx are transient.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

/// Errors from the progress store. Always fatal for a run.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Progress store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt record in {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("Unexpected header in {path}: {found}")]
    Schema { path: PathBuf, found: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that abort a whole batch run.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to discover images under {path}: {reason}")]
    Discovery { path: PathBuf, reason: String },

    #[error("Failed to read metadata {path}: {source}")]
    Metadata { path: PathBuf, source: csv::Error },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_and_server_errors_are_transient() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(classify_status(status), FailureKind::Transient, "{status}");
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 413] {
            assert_eq!(classify_status(status), FailureKind::Permanent, "{status}");
        }
    }

    #[test]
    fn test_error_kinds() {
        assert!(CaptionError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CaptionError::InvalidResponse("garbage".into()).is_transient());
        assert!(!CaptionError::EmptyCaption.is_transient());
        assert!(!CaptionError::Blocked("SAFETY".into()).is_transient());
        assert!(CaptionError::Http {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!CaptionError::Http {
            status: 401,
            body: "bad key".into()
        }
        .is_transient());
    }
}
