//! Opaque content-addressed store for completed recordings.

use async_trait::async_trait;
use bytes::Bytes;

use crate::result::AppResult;
use crate::types::id::TenantId;

/// Stores completed recording audio, keyed by (tenant, recording key).
///
/// The engine only needs existence checks (the `Cached` fast path of the
/// submit gate) and writes; retrieval is served elsewhere.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug + 'static {
    /// Whether a completed artifact already exists for this recording.
    async fn exists(&self, tenant_id: TenantId, recording_key: &str) -> AppResult<bool>;

    /// Persist the recording bytes; returns an opaque reference to the
    /// stored artifact.
    async fn put(&self, tenant_id: TenantId, recording_key: &str, data: Bytes)
        -> AppResult<String>;
}
