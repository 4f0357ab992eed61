//! Download job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use callrec_core::error::{AppError, ErrorKind};
use callrec_core::result::AppResult;
use callrec_core::types::id::{DownloadJobId, TenantId};
use callrec_entity::download::{CreateDownloadJob, DownloadJob};

use crate::repository::DownloadJobRepository;

/// PostgreSQL-backed download job repository.
#[derive(Debug, Clone)]
pub struct PgDownloadJobRepository {
    pool: PgPool,
}

impl PgDownloadJobRepository {
    /// Create a new repository over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DownloadJobRepository for PgDownloadJobRepository {
    async fn create(&self, data: &CreateDownloadJob) -> AppResult<DownloadJob> {
        sqlx::query_as::<_, DownloadJob>(
            "INSERT INTO download_jobs (tenant_id, recording_key, source_url) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(data.tenant_id)
        .bind(&data.recording_key)
        .bind(&data.source_url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => AppError::conflict(format!(
                "An active download already exists for recording '{}'",
                data.recording_key
            )),
            _ => AppError::with_source(ErrorKind::Database, "Failed to create download job", e),
        })
    }

    async fn find_by_id(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>("SELECT * FROM download_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to find download job", e)
            })
    }

    async fn find_active_by_key(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<Option<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "SELECT * FROM download_jobs \
             WHERE tenant_id = $1 AND recording_key = $2 AND status IN ('queued', 'running')",
        )
        .bind(tenant_id)
        .bind(recording_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to find active download job", e)
        })
    }

    async fn find_latest_by_key(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<Option<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "SELECT * FROM download_jobs \
             WHERE tenant_id = $1 AND recording_key = $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(tenant_id)
        .bind(recording_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to find latest download job", e)
        })
    }

    async fn mark_running(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "UPDATE download_jobs \
             SET status = 'running', started_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'queued' AND cancel_requested = FALSE \
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to mark download job running", e)
        })
    }

    async fn mark_completed(&self, id: DownloadJobId, artifact_ref: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE download_jobs \
             SET status = 'completed', artifact_ref = $2, error_message = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(artifact_ref)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to complete download job", e)
        })?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: DownloadJobId,
        error_message: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE download_jobs \
             SET status = 'failed', error_message = $2, fail_count = fail_count + 1, \
                 next_retry_at = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(id)
        .bind(error_message)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to fail download job", e))?;
        Ok(())
    }

    async fn mark_cancelled(&self, id: DownloadJobId) -> AppResult<()> {
        sqlx::query(
            "UPDATE download_jobs \
             SET status = 'cancelled', completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to cancel download job", e)
        })?;
        Ok(())
    }

    async fn request_cancel(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "UPDATE download_jobs \
             SET cancel_requested = TRUE, \
                 status = CASE WHEN status = 'queued' \
                               THEN 'cancelled'::download_status ELSE status END, \
                 completed_at = CASE WHEN status = 'queued' \
                                     THEN NOW() ELSE completed_at END, \
                 updated_at = NOW() \
             WHERE id = $1 AND status IN ('queued', 'running') \
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to request download cancel", e)
        })
    }

    async fn find_stuck(
        &self,
        tenant_id: Option<TenantId>,
        running_before: DateTime<Utc>,
        queued_before: DateTime<Utc>,
    ) -> AppResult<Vec<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "SELECT * FROM download_jobs \
             WHERE ((status = 'running' AND (started_at < $1 OR started_at IS NULL)) \
                OR (status = 'queued' AND created_at < $2)) \
               AND ($3::uuid IS NULL OR tenant_id = $3) \
             ORDER BY created_at ASC",
        )
        .bind(running_before)
        .bind(queued_before)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to find stuck download jobs", e)
        })
    }

    async fn list_active(&self, tenant_id: TenantId, limit: i64) -> AppResult<Vec<DownloadJob>> {
        sqlx::query_as::<_, DownloadJob>(
            "SELECT * FROM download_jobs \
             WHERE tenant_id = $1 AND status IN ('queued', 'running') \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to list active download jobs", e)
        })
    }
}
