//! Persistence seam for download jobs.
//!
//! The engine talks to storage through this trait so the worker loop and
//! the stuck-job monitor can be exercised against an in-memory
//! implementation in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use callrec_core::result::AppResult;
use callrec_core::types::id::{DownloadJobId, TenantId};
use callrec_entity::download::{CreateDownloadJob, DownloadJob};

/// Repository for download job persistence and lifecycle transitions.
///
/// All transition methods are conditional updates: they only apply when
/// the row is in a state the transition is legal from, and return the
/// updated row (or `None` when the guard did not match). This keeps the
/// status machine race-free without explicit locking.
#[async_trait]
pub trait DownloadJobRepository: Send + Sync + std::fmt::Debug + 'static {
    /// Insert a new job in `queued` status.
    ///
    /// Fails with a conflict when another active job already exists for
    /// the same `(tenant_id, recording_key)` pair.
    async fn create(&self, data: &CreateDownloadJob) -> AppResult<DownloadJob>;

    /// Find a job by ID.
    async fn find_by_id(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>>;

    /// Find the active (queued or running) job for a recording, if any.
    async fn find_active_by_key(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<Option<DownloadJob>>;

    /// Find the most recently created job for a recording regardless of
    /// status. Feeds the status surface after the active job finished.
    async fn find_latest_by_key(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<Option<DownloadJob>>;

    /// Transition `queued` -> `running` and stamp `started_at`.
    ///
    /// Returns `None` when the job is no longer queued or a cancel was
    /// requested in the meantime.
    async fn mark_running(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>>;

    /// Transition `running` -> `completed` and record the artifact.
    async fn mark_completed(&self, id: DownloadJobId, artifact_ref: &str) -> AppResult<()>;

    /// Transition an active job to `failed`, bump `fail_count` and set
    /// the earliest resubmission time.
    async fn mark_failed(
        &self,
        id: DownloadJobId,
        error_message: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> AppResult<()>;

    /// Transition an active job to `cancelled`.
    async fn mark_cancelled(&self, id: DownloadJobId) -> AppResult<()>;

    /// Flag a cancel on an active job.
    ///
    /// Queued jobs are cancelled immediately; running jobs only get the
    /// flag set and the worker honors it at its next checkpoint. Returns
    /// the updated row, or `None` when the job is not active.
    async fn request_cancel(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>>;

    /// Find jobs that look abandoned: running since before
    /// `running_before` (or running with no start stamp at all), or
    /// queued since before `queued_before`. Optionally scoped to one
    /// tenant.
    async fn find_stuck(
        &self,
        tenant_id: Option<TenantId>,
        running_before: DateTime<Utc>,
        queued_before: DateTime<Utc>,
    ) -> AppResult<Vec<DownloadJob>>;

    /// List a tenant's active jobs, most recent first.
    async fn list_active(&self, tenant_id: TenantId, limit: i64) -> AppResult<Vec<DownloadJob>>;
}
