//! Classifier artifact persistence.
//!
//! Artifacts are JSON blobs written to a temporary file in the target
//! directory and renamed into place, so readers see either the previous
//! file or the complete new one.

use crate::forest::RandomForest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize artifact: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("corrupt artifact {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The persisted model: the classifier plus the embedding geometry it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub embedding_side: u32,
    pub samples: usize,
    pub classifier: RandomForest,
}

/// A single-valued artifact location.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    path: PathBuf,
}

impl ArtifactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the artifact, or `None` when nothing has been saved yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io { path: self.path.clone(), source });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Deserialize { path: self.path.clone(), source })
    }

    /// Atomically replace the artifact. Returns the SHA-256 hex digest of the bytes written.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<String, StoreError> {
        let bytes = serde_json::to_vec(value).map_err(StoreError::Serialize)?;
        write_atomic(&self.path, &bytes)
            .map_err(|source| StoreError::Io { path: self.path.clone(), source })?;

        let digest = format!("{:x}", Sha256::digest(&bytes));
        tracing::info!(
            path = %self.path.display(),
            bytes = bytes.len(),
            sha256 = %digest,
            "artifact persisted"
        );
        Ok(digest)
    }
}

/// Write `bytes` to `path` via a synced temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
