//! Download job model.

use callrec_core::types::id::{DownloadJobId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::DownloadStatus;

/// A single recording acquisition attempt for one tenant.
///
/// At most one job per `(tenant_id, recording_key)` pair may be in an
/// active status at any time; the database enforces this with a partial
/// unique index.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DownloadJob {
    pub id: DownloadJobId,
    pub tenant_id: TenantId,
    /// Provider-side identifier of the recording being fetched.
    pub recording_key: String,
    /// Upstream URL the audio is fetched from.
    pub source_url: String,
    pub status: DownloadStatus,
    /// Set when a cancel arrives while the job is already running; the
    /// worker checks it before starting the fetch.
    pub cancel_requested: bool,
    /// Consecutive failures counted against the retry budget.
    pub fail_count: i32,
    /// Earliest time a resubmission will be accepted after a failure.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Storage reference of the stored audio, set on completion.
    pub artifact_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadJob {
    /// Whether a cancel request can still take effect.
    pub fn is_cancellable(&self) -> bool {
        self.status.is_active()
    }
}

/// Payload for creating a new download job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDownloadJob {
    pub tenant_id: TenantId,
    pub recording_key: String,
    pub source_url: String,
}
