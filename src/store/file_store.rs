//! JsonFileStore: the registry document on disk.
//!
//! The whole collection is written as one pretty-printed JSON array on every
//! save. Writes overwrite the file in place (no temp file + rename, no WAL),
//! so a crash mid-write can leave a truncated document behind. A truncated or
//! otherwise unreadable document is reported by `load` and the caller starts
//! empty.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::models::service::Service;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a valid registry document: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode registry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted collection. A missing file is an empty registry.
    pub async fn load(&self) -> Result<Vec<Service>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Overwrite the document with `services`.
    pub async fn save(&self, services: &[Service]) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(services)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&self.path, encoded)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }
}
