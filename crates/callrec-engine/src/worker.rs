//! Download worker: executes one admitted job and always hands its slot
//! back, whatever happened.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use callrec_core::result::AppResult;
use callrec_core::traits::artifact::ArtifactStore;
use callrec_core::traits::dispatch::JobDispatcher;
use callrec_core::traits::fetcher::{FetchError, RecordingFetcher};
use callrec_core::types::id::{DownloadJobId, TenantId};
use callrec_database::repository::DownloadJobRepository;
use callrec_entity::download::DownloadJob;
use callrec_slots::allocator::SlotAllocator;

use crate::dispatcher::DispatchMessage;
use crate::retry::RetryBudget;

/// Base delay between failed attempts; scaled by the attempt number.
const RETRY_BACKOFF_BASE_SECS: i64 = 60;

/// Processes dispatched download jobs.
#[derive(Debug, Clone)]
pub struct DownloadWorker {
    repo: Arc<dyn DownloadJobRepository>,
    slots: Arc<dyn SlotAllocator>,
    fetcher: Arc<dyn RecordingFetcher>,
    artifacts: Arc<dyn ArtifactStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    retry: RetryBudget,
}

impl DownloadWorker {
    /// Wire up a worker.
    pub fn new(
        repo: Arc<dyn DownloadJobRepository>,
        slots: Arc<dyn SlotAllocator>,
        fetcher: Arc<dyn RecordingFetcher>,
        artifacts: Arc<dyn ArtifactStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        retry: RetryBudget,
    ) -> Self {
        Self {
            repo,
            slots,
            fetcher,
            artifacts,
            dispatcher,
            retry,
        }
    }

    /// Process one job, then release its slot unconditionally.
    ///
    /// Every exit path of the execution — success, failure, cancel,
    /// missing row, repository error — flows through exactly one release,
    /// and a promoted waiter is dispatched before returning. Release
    /// failures are logged, never propagated; the liveness marker's TTL
    /// is the backstop.
    pub async fn process(&self, tenant_id: TenantId, job_id: DownloadJobId) {
        if let Err(e) = self.execute(tenant_id, job_id).await {
            error!(%tenant_id, %job_id, error = %e, "Download job processing failed");
        }

        match self.slots.release(tenant_id, job_id).await {
            Ok(Some(next)) => {
                debug!(%tenant_id, %job_id, promoted = %next, "Dispatching promoted waiter");
                if let Err(e) = self.dispatcher.dispatch(tenant_id, next).await {
                    error!(%tenant_id, promoted = %next, error = %e, "Failed to dispatch promoted job");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(%tenant_id, %job_id, error = %e, "Failed to release slot; marker TTL will reclaim it");
            }
        }
    }

    async fn execute(&self, tenant_id: TenantId, job_id: DownloadJobId) -> AppResult<()> {
        let Some(job) = self.repo.find_by_id(job_id).await? else {
            warn!(%tenant_id, %job_id, "Dispatched job row is missing");
            return Ok(());
        };
        if job.tenant_id != tenant_id {
            warn!(%tenant_id, %job_id, "Dispatched job belongs to a different tenant, skipping");
            return Ok(());
        }

        if job.cancel_requested {
            self.repo.mark_cancelled(job_id).await?;
            info!(%tenant_id, %job_id, "Download cancelled before start");
            return Ok(());
        }

        let Some(running) = self.repo.mark_running(job_id).await? else {
            // Cancelled or already claimed since dispatch.
            info!(%tenant_id, %job_id, "Job no longer runnable, skipping");
            return Ok(());
        };

        match self.fetcher.fetch(&running.source_url).await {
            Ok(data) => self.complete(&running, data).await,
            Err(e) => self.fail(&running, e).await,
        }
    }

    async fn complete(&self, job: &DownloadJob, data: bytes::Bytes) -> AppResult<()> {
        let artifact_ref = match self
            .artifacts
            .put(job.tenant_id, &job.recording_key, data)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                // The audio was fetched but could not be kept; treat like
                // a recoverable failure so a resubmission tries again.
                return self
                    .fail(job, FetchError::Recoverable(format!("artifact store: {e}")))
                    .await;
            }
        };

        self.repo.mark_completed(job.id, &artifact_ref).await?;
        if let Err(e) = self.retry.clear(job.tenant_id, &job.recording_key).await {
            warn!(job_id = %job.id, error = %e, "Failed to clear retry budget after success");
        }
        info!(
            tenant_id = %job.tenant_id,
            job_id = %job.id,
            recording_key = %job.recording_key,
            "Download completed"
        );
        Ok(())
    }

    async fn fail(&self, job: &DownloadJob, cause: FetchError) -> AppResult<()> {
        let message = cause.to_string();

        if cause.is_recoverable() {
            let attempts = match self
                .retry
                .record_failure(job.tenant_id, &job.recording_key)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to record retry attempt");
                    job.fail_count.max(0) as u32 + 1
                }
            };
            let next_retry_at =
                Utc::now() + chrono::Duration::seconds(RETRY_BACKOFF_BASE_SECS * attempts as i64);
            self.repo
                .mark_failed(job.id, &message, Some(next_retry_at))
                .await?;
            warn!(
                tenant_id = %job.tenant_id,
                job_id = %job.id,
                attempts,
                "Download failed (recoverable): {message}"
            );
        } else {
            if let Err(e) = self.retry.exhaust(job.tenant_id, &job.recording_key).await {
                warn!(job_id = %job.id, error = %e, "Failed to exhaust retry budget");
            }
            self.repo.mark_failed(job.id, &message, None).await?;
            error!(
                tenant_id = %job.tenant_id,
                job_id = %job.id,
                "Download failed (fatal): {message}"
            );
        }
        Ok(())
    }
}

/// Worker runner: receives dispatched jobs and executes them under a
/// concurrency cap, draining in-flight work on shutdown.
#[derive(Debug)]
pub struct WorkerRunner {
    worker: Arc<DownloadWorker>,
    rx: mpsc::Receiver<DispatchMessage>,
    concurrency: usize,
}

impl WorkerRunner {
    /// Create a runner over the dispatch channel's receiver half.
    pub fn new(
        worker: Arc<DownloadWorker>,
        rx: mpsc::Receiver<DispatchMessage>,
        concurrency: usize,
    ) -> Self {
        Self {
            worker,
            rx,
            concurrency,
        }
    }

    /// Run until the cancel signal fires or the dispatch channel closes.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        info!(concurrency = self.concurrency, "Download worker runner started");

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("Worker runner received shutdown signal");
                        break;
                    }
                }
                message = self.rx.recv() => {
                    let Some((tenant_id, job_id)) = message else {
                        info!("Dispatch channel closed, worker runner stopping");
                        break;
                    };
                    let permit = match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let worker = Arc::clone(&self.worker);
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.process(tenant_id, job_id).await;
                    });
                }
            }
        }

        info!("Worker runner waiting for in-flight downloads to complete...");
        let _ = tokio::time::timeout(
            Duration::from_secs(30),
            semaphore.acquire_many(self.concurrency as u32),
        )
        .await;
        info!("Worker runner shut down");
    }
}
