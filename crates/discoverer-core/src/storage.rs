//! Filesystem storage for built dataset payloads.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::dataset::DatasetAddress;
use crate::error::AppError;
use crate::traits::ArtifactSink;

/// Writes payloads below a root directory.
///
/// References are relative paths of the form
/// `{name}/{config_hash}/{source_token}.{ext}`. Payloads are written to a
/// temporary file first and renamed into place.
#[derive(Debug, Clone)]
pub struct LocalArtifactSink {
    root: PathBuf,
}

impl LocalArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a reference to a path, rejecting anything escaping the root.
    pub fn resolve(&self, payload_ref: &str) -> Result<PathBuf, AppError> {
        let relative = Path::new(payload_ref);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || payload_ref.is_empty() {
            return Err(AppError::StorageError(format!(
                "invalid payload reference: {}",
                payload_ref
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::StorageError(format!("{}: {}", path.display(), e))
}

impl ArtifactSink for LocalArtifactSink {
    async fn put(
        &self,
        address: &DatasetAddress,
        source_token: &str,
        payload: Vec<u8>,
    ) -> Result<String, AppError> {
        let payload_ref = format!(
            "{}/{}/{}.{}",
            address.name,
            address.config_hash,
            source_token,
            address.format.extension()
        );
        let path = self.resolve(&payload_ref)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(parent, e))?;
        }

        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &payload)
            .await
            .map_err(|e| storage_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error(&path, e))?;

        debug!(path = %path.display(), bytes = payload.len(), "Stored dataset payload");
        Ok(payload_ref)
    }

    async fn open(&self, payload_ref: &str) -> Result<Vec<u8>, AppError> {
        let path = self.resolve(payload_ref)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| storage_error(&path, e))
    }
}
