use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::BatchError;
use crate::types::ImageRecord;

/// Image extensions picked up by a directory scan.
pub const DEFAULT_EXTENSIONS: [&str; 8] = ["bmp", "gif", "jpeg", "jpg", "png", "tif", "tiff", "webp"];

/// Where the batch finds its images.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Recursively scan a directory.
    Directory {
        root: PathBuf,
        extensions: Vec<String>,
    },
    /// Read one path per line from a text file.
    Manifest(PathBuf),
}

impl ImageSource {
    pub fn directory(root: impl Into<PathBuf>) -> Self {
        ImageSource::Directory {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Enumerate records, deduplicated by identifier and sorted lexicographically.
    pub fn discover(&self) -> Result<Vec<ImageRecord>, BatchError> {
        match self {
            ImageSource::Directory { root, extensions } => scan_directory(root, extensions),
            ImageSource::Manifest(path) => read_manifest(path),
        }
    }
}

/// Normalize a user-supplied extension list (`.PNG`, `jpg ` -> `png`, `jpg`).
pub fn parse_extensions(list: &str) -> Vec<String> {
    list.split(',')
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn to_id(relative: &Path) -> String {
    relative.to_string_lossy().replace('\\', "/")
}

fn scan_directory(root: &Path, extensions: &[String]) -> Result<Vec<ImageRecord>, BatchError> {
    if !root.is_dir() {
        return Err(BatchError::Discovery {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut found = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let matches = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| extensions.iter().any(|e| *e == ext));
        if !matches {
            continue;
        }

        let relative = path.strip_prefix(root).unwrap_or(path);
        found.insert(to_id(relative), path.to_path_buf());
    }

    Ok(found
        .into_iter()
        .map(|(id, path)| ImageRecord::new(id, path))
        .collect())
}

fn read_manifest(manifest: &Path) -> Result<Vec<ImageRecord>, BatchError> {
    let text = std::fs::read_to_string(manifest).map_err(|e| BatchError::Discovery {
        path: manifest.to_path_buf(),
        reason: e.to_string(),
    })?;
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));

    let mut found = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let id = line.replace('\\', "/");
        let listed = PathBuf::from(&id);
        let path = if listed.is_absolute() {
            listed
        } else {
            base.join(listed)
        };
        found.entry(id).or_insert(path);
    }

    Ok(found
        .into_iter()
        .map(|(id, path)| ImageRecord::new(id, path))
        .collect())
}
