//! Recording acquisition service: the submit deduplication gate and the
//! status/cancel/list surface.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use callrec_core::error::ErrorKind;
use callrec_core::result::AppResult;
use callrec_core::traits::artifact::ArtifactStore;
use callrec_core::traits::dispatch::JobDispatcher;
use callrec_core::types::id::{DownloadJobId, TenantId};
use callrec_database::repository::DownloadJobRepository;
use callrec_entity::download::{CreateDownloadJob, DownloadJob, DownloadStatus};
use callrec_slots::allocator::{AcquireOutcome, SlotAllocator};

use crate::retry::RetryBudget;

/// Outcome of a submit request.
///
/// Duplicate and fail-fast conditions are outcomes, not errors; callers
/// treat all of these as a handled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// The recording is already stored; nothing to do.
    Cached,
    /// A download for this recording is already running.
    AlreadyActive(DownloadJobId),
    /// A download for this recording is already waiting.
    AlreadyQueued(DownloadJobId),
    /// A new job was admitted (running now or parked in the wait queue).
    Enqueued(DownloadJobId),
    /// The retry budget for this recording is spent; the upstream worker
    /// appears offline. No job was created.
    Offline { reason: String },
    /// Admission was refused (coordination outage with fail-open off).
    Rejected { reason: String },
}

/// Point-in-time status of a recording for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReport {
    /// Artifact stored and ready.
    Ready,
    /// A worker is downloading it right now.
    Processing,
    /// Waiting for a slot (or for a worker to pick it up).
    Queued {
        /// 1-based wait-queue position, when actually parked.
        position: Option<u64>,
        /// Wait-queue length at read time.
        length: u64,
    },
    /// The last attempt failed.
    Failed {
        reason: Option<String>,
        /// True when the retry budget is spent and submits fail-fast.
        offline: bool,
    },
    /// Never submitted (or all traces aged out).
    Unknown,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The cancel was recorded (and applied immediately for queued jobs).
    Ok,
    /// No such job for this tenant.
    NotFound,
    /// The job already reached a terminal state.
    AlreadyFinished,
}

/// The acquisition engine's public service surface.
#[derive(Debug, Clone)]
pub struct RecordingService {
    repo: Arc<dyn DownloadJobRepository>,
    slots: Arc<dyn SlotAllocator>,
    artifacts: Arc<dyn ArtifactStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    retry: RetryBudget,
    fail_open: bool,
    list_limit: i64,
}

impl RecordingService {
    /// Wire up the service.
    pub fn new(
        repo: Arc<dyn DownloadJobRepository>,
        slots: Arc<dyn SlotAllocator>,
        artifacts: Arc<dyn ArtifactStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        retry: RetryBudget,
        fail_open: bool,
    ) -> Self {
        Self {
            repo,
            slots,
            artifacts,
            dispatcher,
            retry,
            fail_open,
            list_limit: 100,
        }
    }

    /// Admit a recording for download, deduplicating against stored
    /// artifacts, active jobs, and the spent retry budget — in that
    /// order. At most one new row is ever created per call.
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
        source_url: &str,
    ) -> AppResult<SubmitOutcome> {
        if self.artifacts.exists(tenant_id, recording_key).await? {
            return Ok(SubmitOutcome::Cached);
        }

        if let Some(active) = self
            .repo
            .find_active_by_key(tenant_id, recording_key)
            .await?
        {
            return Ok(Self::duplicate_outcome(&active));
        }

        if self.retry.is_exhausted(tenant_id, recording_key).await? {
            warn!(%tenant_id, recording_key, "Submit refused, retry budget spent");
            return Ok(SubmitOutcome::Offline {
                reason: format!(
                    "upstream worker appears offline for recording '{recording_key}'"
                ),
            });
        }

        let job = match self
            .repo
            .create(&CreateDownloadJob {
                tenant_id,
                recording_key: recording_key.to_string(),
                source_url: source_url.to_string(),
            })
            .await
        {
            Ok(job) => job,
            // Two submitters raced past the active check; the partial
            // unique index decided the winner.
            Err(e) if e.kind == ErrorKind::Conflict => {
                return match self
                    .repo
                    .find_active_by_key(tenant_id, recording_key)
                    .await?
                {
                    Some(active) => Ok(Self::duplicate_outcome(&active)),
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        match self.slots.try_acquire(tenant_id, job.id).await {
            Ok(AcquireOutcome::Acquired) => {
                self.dispatch(tenant_id, job.id).await;
                info!(%tenant_id, %job.id, recording_key, "Download admitted into a slot");
            }
            Ok(AcquireOutcome::Queued { position }) => {
                info!(%tenant_id, %job.id, recording_key, position, "Download parked in wait queue");
            }
            Ok(AcquireOutcome::AlreadyInFlight | AcquireOutcome::AlreadyQueued) => {
                // A fresh job id colliding in the slot store means stale
                // state; do not dispatch a second time.
                warn!(%tenant_id, %job.id, "New job already known to the slot store, skipping dispatch");
            }
            Err(e) if self.fail_open => {
                error!(
                    %tenant_id, %job.id, error = %e,
                    "Slot store unreachable, admitting without a slot (fail-open)"
                );
                self.dispatch(tenant_id, job.id).await;
            }
            Err(e) => {
                let reason = format!("slot coordination unavailable: {e}");
                self.repo.mark_failed(job.id, &reason, None).await?;
                return Ok(SubmitOutcome::Rejected { reason });
            }
        }

        Ok(SubmitOutcome::Enqueued(job.id))
    }

    fn duplicate_outcome(active: &DownloadJob) -> SubmitOutcome {
        match active.status {
            DownloadStatus::Running => SubmitOutcome::AlreadyActive(active.id),
            _ => SubmitOutcome::AlreadyQueued(active.id),
        }
    }

    /// Dispatch, logging failures instead of surfacing them: an
    /// undispatched queued job is picked up by the stuck-job monitor.
    async fn dispatch(&self, tenant_id: TenantId, job_id: DownloadJobId) {
        if let Err(e) = self.dispatcher.dispatch(tenant_id, job_id).await {
            error!(%tenant_id, %job_id, error = %e, "Failed to dispatch job to workers");
        }
    }

    /// Report the status of a recording.
    pub async fn get_status(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<StatusReport> {
        if self.artifacts.exists(tenant_id, recording_key).await? {
            return Ok(StatusReport::Ready);
        }

        let Some(job) = self
            .repo
            .find_latest_by_key(tenant_id, recording_key)
            .await?
        else {
            return Ok(StatusReport::Unknown);
        };

        match job.status {
            DownloadStatus::Running => Ok(StatusReport::Processing),
            DownloadStatus::Queued => {
                // Best-effort snapshot; the queue may shift underneath us.
                let snapshot = match self.slots.queue_snapshot(tenant_id, job.id).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%tenant_id, %job.id, error = %e, "Queue snapshot unavailable");
                        return Ok(StatusReport::Queued {
                            position: None,
                            length: 0,
                        });
                    }
                };
                Ok(StatusReport::Queued {
                    position: snapshot.position,
                    length: snapshot.length,
                })
            }
            DownloadStatus::Failed => Ok(StatusReport::Failed {
                reason: job.error_message.clone(),
                offline: self.retry.is_exhausted(tenant_id, recording_key).await?,
            }),
            DownloadStatus::Completed => Ok(StatusReport::Ready),
            DownloadStatus::Cancelled => Ok(StatusReport::Unknown),
        }
    }

    /// Request cancellation of a job.
    ///
    /// Queued jobs are cancelled (and their queue entry released) right
    /// away; running jobs get the flag set and the worker honors it at
    /// its next checkpoint. Idempotent.
    pub async fn request_cancel(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<CancelOutcome> {
        let Some(job) = self.repo.find_by_id(job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.tenant_id != tenant_id {
            return Ok(CancelOutcome::NotFound);
        }
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }

        let Some(updated) = self.repo.request_cancel(job_id).await? else {
            // Finished between the read and the write.
            return Ok(CancelOutcome::AlreadyFinished);
        };

        if updated.status == DownloadStatus::Cancelled {
            // The job never reached a worker, so no worker will release
            // its queue entry; do it here and hand the freed capacity on.
            match self.slots.release(tenant_id, job_id).await {
                Ok(Some(next)) => self.dispatch(tenant_id, next).await,
                Ok(None) => {}
                Err(e) => {
                    error!(%tenant_id, %job_id, error = %e, "Failed to release slot after cancel");
                }
            }
            info!(%tenant_id, %job_id, "Queued download cancelled");
        } else {
            info!(%tenant_id, %job_id, "Cancel flagged for running download");
        }

        Ok(CancelOutcome::Ok)
    }

    /// List the tenant's active downloads, most recent first.
    pub async fn list_active(&self, tenant_id: TenantId) -> AppResult<Vec<DownloadJob>> {
        self.repo.list_active(tenant_id, self.list_limit).await
    }
}
