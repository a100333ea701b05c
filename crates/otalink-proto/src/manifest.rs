//! Update manifest: which files make up an update, in which order.
//!
//! The manifest travels as a small JSON header ahead of the compressed
//! payload. Its totals are advisory (used for the space check); the wire
//! length prefixes are authoritative for framing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One file in the update, identified by its path relative to the app root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

/// Ordered file list plus totals. File contents are concatenated in exactly
/// this order inside the compressed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub total_files: u32,
    pub total_size_bytes: u64,
    pub files: Vec<FileEntry>,
}

/// Why a received manifest was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("file count {declared} does not match {actual} entries")]
    CountMismatch { declared: u32, actual: usize },
    #[error("entry sizes sum to {actual}, manifest declares {declared}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("unsafe path in manifest: {0:?}")]
    UnsafePath(String),
}

impl Manifest {
    /// Build a manifest with totals derived from the entries.
    pub fn new(files: Vec<FileEntry>) -> Self {
        let total_size_bytes = files.iter().map(|f| f.size).sum();
        Self {
            total_files: files.len() as u32,
            total_size_bytes,
            files,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Refuse manifests that lie about their totals or could escape the
    /// install root. Runs on the device before any staging write.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.total_files as usize != self.files.len() {
            return Err(ManifestError::CountMismatch {
                declared: self.total_files,
                actual: self.files.len(),
            });
        }
        let actual: u64 = self.files.iter().map(|f| f.size).sum();
        if actual != self.total_size_bytes {
            return Err(ManifestError::SizeMismatch {
                declared: self.total_size_bytes,
                actual,
            });
        }
        for entry in &self.files {
            if !is_safe_path(&entry.path) {
                return Err(ManifestError::UnsafePath(entry.path.clone()));
            }
        }
        Ok(())
    }
}

/// A safe path is relative, uses forward slashes, and never steps out of
/// its root.
fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    path.split('/')
        .all(|part| !part.is_empty() && part != "." && part != "..")
}
