//! Filesystem-backed artifact store.
//!
//! Artifacts live under `{data_root}/{tenant_id}/{encoded_key}.audio`.
//! The recording key comes from the provider and may contain path
//! separators, so it is base64url-encoded before touching the
//! filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use callrec_core::error::{AppError, ErrorKind};
use callrec_core::result::AppResult;
use callrec_core::traits::artifact::ArtifactStore;
use callrec_core::types::id::TenantId;

/// Local-disk artifact store.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Create a store rooted at `data_root`.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            root: data_root.into(),
        }
    }

    fn artifact_path(&self, tenant_id: TenantId, recording_key: &str) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(recording_key.as_bytes());
        self.root
            .join(tenant_id.to_string())
            .join(format!("{encoded}.audio"))
    }

    fn map_io(message: &str, path: &Path, e: std::io::Error) -> AppError {
        AppError::with_source(
            ErrorKind::Storage,
            format!("{message}: {}", path.display()),
            e,
        )
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn exists(&self, tenant_id: TenantId, recording_key: &str) -> AppResult<bool> {
        let path = self.artifact_path(tenant_id, recording_key);
        fs::try_exists(&path)
            .await
            .map_err(|e| Self::map_io("Failed to probe artifact", &path, e))
    }

    async fn put(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
        data: Bytes,
    ) -> AppResult<String> {
        let path = self.artifact_path(tenant_id, recording_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_io("Failed to create artifact directory", parent, e))?;
        }

        // Write to a temp name then rename, so a crash mid-write never
        // leaves a partial artifact that passes the exists() check.
        let tmp = path.with_extension("audio.part");
        fs::write(&tmp, &data)
            .await
            .map_err(|e| Self::map_io("Failed to write artifact", &tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::map_io("Failed to finalize artifact", &path, e))?;

        debug!(%tenant_id, recording_key, bytes = data.len(), "Artifact stored");
        Ok(path.to_string_lossy().into_owned())
    }
}
