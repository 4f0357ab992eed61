//! End-to-end engine tests over the in-memory slot allocator and
//! in-memory fakes for the repository, fetcher, artifact store, and
//! dispatch surface.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};

use callrec_core::config::monitor::MonitorConfig;
use callrec_core::config::slots::SlotConfig;
use callrec_core::error::AppError;
use callrec_core::result::AppResult;
use callrec_core::traits::artifact::ArtifactStore;
use callrec_core::traits::cache::CacheProvider;
use callrec_core::traits::dispatch::JobDispatcher;
use callrec_core::traits::fetcher::{FetchError, RecordingFetcher};
use callrec_core::types::id::{DownloadJobId, TenantId};
use callrec_database::repository::DownloadJobRepository;
use callrec_entity::download::{CreateDownloadJob, DownloadJob, DownloadStatus};
use callrec_slots::allocator::{AcquireOutcome, QueueSnapshot, SlotAllocator};
use callrec_slots::memory::MemorySlotAllocator;

use callrec_cache::memory::MemoryCacheProvider;
use callrec_core::config::cache::MemoryCacheConfig;
use callrec_engine::monitor::StuckJobMonitor;
use callrec_engine::retry::RetryBudget;
use callrec_engine::service::{CancelOutcome, RecordingService, StatusReport, SubmitOutcome};
use callrec_engine::worker::DownloadWorker;

// ── Fakes ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct InMemoryJobRepository {
    rows: Mutex<Vec<DownloadJob>>,
}

impl InMemoryJobRepository {
    fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn status_of(&self, id: DownloadJobId) -> Option<DownloadStatus> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .map(|j| j.status)
    }

    fn backdate(&self, id: DownloadJobId, by: Duration) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.iter_mut().find(|j| j.id == id) {
            job.created_at -= by;
            if let Some(started) = job.started_at.as_mut() {
                *started -= by;
            }
        }
    }
}

#[async_trait]
impl DownloadJobRepository for InMemoryJobRepository {
    async fn create(&self, data: &CreateDownloadJob) -> AppResult<DownloadJob> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|j| {
            j.tenant_id == data.tenant_id
                && j.recording_key == data.recording_key
                && j.status.is_active()
        }) {
            return Err(AppError::conflict("active download already exists"));
        }
        let now = Utc::now();
        let job = DownloadJob {
            id: DownloadJobId::new(),
            tenant_id: data.tenant_id,
            recording_key: data.recording_key.clone(),
            source_url: data.source_url.clone(),
            status: DownloadStatus::Queued,
            cancel_requested: false,
            fail_count: 0,
            next_retry_at: None,
            artifact_ref: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        rows.push(job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn find_active_by_key(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<Option<DownloadJob>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|j| {
                j.tenant_id == tenant_id
                    && j.recording_key == recording_key
                    && j.status.is_active()
            })
            .cloned())
    }

    async fn find_latest_by_key(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<Option<DownloadJob>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.tenant_id == tenant_id && j.recording_key == recording_key)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn mark_running(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>> {
        let mut rows = self.rows.lock().unwrap();
        let Some(job) = rows.iter_mut().find(|j| {
            j.id == id && j.status == DownloadStatus::Queued && !j.cancel_requested
        }) else {
            return Ok(None);
        };
        job.status = DownloadStatus::Running;
        job.started_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: DownloadJobId, artifact_ref: &str) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows
            .iter_mut()
            .find(|j| j.id == id && j.status == DownloadStatus::Running)
        {
            job.status = DownloadStatus::Completed;
            job.artifact_ref = Some(artifact_ref.to_string());
            job.completed_at = Some(Utc::now());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: DownloadJobId,
        error_message: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.iter_mut().find(|j| j.id == id && j.status.is_active()) {
            job.status = DownloadStatus::Failed;
            job.error_message = Some(error_message.to_string());
            job.fail_count += 1;
            job.next_retry_at = next_retry_at;
            job.completed_at = Some(Utc::now());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_cancelled(&self, id: DownloadJobId) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(job) = rows.iter_mut().find(|j| j.id == id && j.status.is_active()) {
            job.status = DownloadStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn request_cancel(&self, id: DownloadJobId) -> AppResult<Option<DownloadJob>> {
        let mut rows = self.rows.lock().unwrap();
        let Some(job) = rows.iter_mut().find(|j| j.id == id && j.status.is_active()) else {
            return Ok(None);
        };
        job.cancel_requested = true;
        if job.status == DownloadStatus::Queued {
            job.status = DownloadStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn find_stuck(
        &self,
        tenant_id: Option<TenantId>,
        running_before: DateTime<Utc>,
        queued_before: DateTime<Utc>,
    ) -> AppResult<Vec<DownloadJob>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|j| tenant_id.map_or(true, |t| j.tenant_id == t))
            .filter(|j| match j.status {
                DownloadStatus::Running => {
                    j.started_at.map(|s| s < running_before).unwrap_or(true)
                }
                DownloadStatus::Queued => j.created_at < queued_before,
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn list_active(&self, tenant_id: TenantId, limit: i64) -> AppResult<Vec<DownloadJob>> {
        let mut active: Vec<DownloadJob> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.tenant_id == tenant_id && j.status.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        active.truncate(limit as usize);
        Ok(active)
    }
}

/// Slot allocator wrapper that counts release calls per job.
#[derive(Debug)]
struct CountingAllocator {
    inner: MemorySlotAllocator,
    releases: Mutex<HashMap<DownloadJobId, usize>>,
}

impl CountingAllocator {
    fn new(inner: MemorySlotAllocator) -> Self {
        Self {
            inner,
            releases: Mutex::new(HashMap::new()),
        }
    }

    fn release_count(&self, job_id: DownloadJobId) -> usize {
        *self.releases.lock().unwrap().get(&job_id).unwrap_or(&0)
    }
}

#[async_trait]
impl SlotAllocator for CountingAllocator {
    async fn try_acquire(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<AcquireOutcome> {
        self.inner.try_acquire(tenant_id, job_id).await
    }

    async fn release(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<Option<DownloadJobId>> {
        *self.releases.lock().unwrap().entry(job_id).or_insert(0) += 1;
        self.inner.release(tenant_id, job_id).await
    }

    async fn sweep(&self, tenant_id: TenantId) -> AppResult<u64> {
        self.inner.sweep(tenant_id).await
    }

    async fn sweep_all(&self) -> AppResult<u64> {
        self.inner.sweep_all().await
    }

    async fn queue_snapshot(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<QueueSnapshot> {
        self.inner.queue_snapshot(tenant_id, job_id).await
    }
}

/// Slot allocator fake simulating a coordination-store outage.
#[derive(Debug)]
struct OutageAllocator;

impl OutageAllocator {
    fn down() -> AppError {
        AppError::coordination("slot store unreachable")
    }
}

#[async_trait]
impl SlotAllocator for OutageAllocator {
    async fn try_acquire(
        &self,
        _tenant_id: TenantId,
        _job_id: DownloadJobId,
    ) -> AppResult<AcquireOutcome> {
        Err(Self::down())
    }

    async fn release(
        &self,
        _tenant_id: TenantId,
        _job_id: DownloadJobId,
    ) -> AppResult<Option<DownloadJobId>> {
        Err(Self::down())
    }

    async fn sweep(&self, _tenant_id: TenantId) -> AppResult<u64> {
        Err(Self::down())
    }

    async fn sweep_all(&self) -> AppResult<u64> {
        Err(Self::down())
    }

    async fn queue_snapshot(
        &self,
        _tenant_id: TenantId,
        _job_id: DownloadJobId,
    ) -> AppResult<QueueSnapshot> {
        Err(Self::down())
    }
}

/// Dispatcher fake that records dispatched jobs for manual draining.
#[derive(Debug, Default)]
struct RecordingDispatcher {
    sent: Mutex<VecDeque<(TenantId, DownloadJobId)>>,
}

impl RecordingDispatcher {
    fn drain(&self) -> Vec<(TenantId, DownloadJobId)> {
        self.sent.lock().unwrap().drain(..).collect()
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, tenant_id: TenantId, job_id: DownloadJobId) -> AppResult<()> {
        self.sent.lock().unwrap().push_back((tenant_id, job_id));
        Ok(())
    }
}

/// Fetcher fake returning scripted results, defaulting to success.
#[derive(Debug, Default)]
struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<Bytes, FetchError>>>,
}

impl ScriptedFetcher {
    fn push(&self, result: Result<Bytes, FetchError>) {
        self.script.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl RecordingFetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Bytes::from_static(b"audio-bytes")))
    }
}

#[derive(Debug, Default)]
struct MemoryArtifactStore {
    stored: Mutex<HashMap<(TenantId, String), Bytes>>,
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn exists(&self, tenant_id: TenantId, recording_key: &str) -> AppResult<bool> {
        Ok(self
            .stored
            .lock()
            .unwrap()
            .contains_key(&(tenant_id, recording_key.to_string())))
    }

    async fn put(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
        data: Bytes,
    ) -> AppResult<String> {
        self.stored
            .lock()
            .unwrap()
            .insert((tenant_id, recording_key.to_string()), data);
        Ok(format!("mem://{tenant_id}/{recording_key}"))
    }
}

// ── Harness ────────────────────────────────────────────────

struct Harness {
    repo: Arc<InMemoryJobRepository>,
    slots: Arc<CountingAllocator>,
    memory_slots: MemorySlotAllocator,
    artifacts: Arc<MemoryArtifactStore>,
    dispatcher: Arc<RecordingDispatcher>,
    fetcher: Arc<ScriptedFetcher>,
    budget: RetryBudget,
    service: RecordingService,
    worker: DownloadWorker,
    monitor: StuckJobMonitor,
}

fn make_harness() -> Harness {
    let slot_config = SlotConfig {
        max_slots_per_tenant: 3,
        ..SlotConfig::default()
    };
    let monitor_config = MonitorConfig {
        stuck_after_seconds: 300,
        max_retry_attempts: 3,
        retry_window_seconds: 600,
        ..MonitorConfig::default()
    };

    let memory_slots = MemorySlotAllocator::new(&slot_config);
    let slots = Arc::new(CountingAllocator::new(memory_slots.clone()));
    let repo = Arc::new(InMemoryJobRepository::default());
    let artifacts = Arc::new(MemoryArtifactStore::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = Arc::new(ScriptedFetcher::default());

    let cache = Arc::new(MemoryCacheProvider::new(
        &MemoryCacheConfig {
            max_capacity: 1000,
            time_to_live_seconds: 600,
        },
        600,
    ));
    let budget = RetryBudget::new(cache, &monitor_config);

    let service = RecordingService::new(
        repo.clone(),
        slots.clone(),
        artifacts.clone(),
        dispatcher.clone(),
        budget.clone(),
        true,
    );
    let worker = DownloadWorker::new(
        repo.clone(),
        slots.clone(),
        fetcher.clone(),
        artifacts.clone(),
        dispatcher.clone(),
        budget.clone(),
    );
    let monitor = StuckJobMonitor::new(repo.clone(), budget.clone(), &monitor_config);

    Harness {
        repo,
        slots,
        memory_slots,
        artifacts,
        dispatcher,
        fetcher,
        budget,
        service,
        worker,
        monitor,
    }
}

fn job_id(outcome: &SubmitOutcome) -> DownloadJobId {
    match outcome {
        SubmitOutcome::Enqueued(id) => *id,
        other => panic!("expected Enqueued, got {other:?}"),
    }
}

// ── Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn submit_respects_capacity_and_queues_fifo() {
    let h = make_harness();
    let tenant = TenantId::new();

    let mut ids = Vec::new();
    for i in 0..5 {
        let outcome = h
            .service
            .submit(tenant, &format!("rec-{i}"), "https://provider/rec")
            .await
            .unwrap();
        ids.push(job_id(&outcome));
    }

    // The first three got slots and were dispatched; the last two parked.
    let dispatched: Vec<DownloadJobId> = h.dispatcher.drain().into_iter().map(|(_, j)| j).collect();
    assert_eq!(dispatched, ids[..3].to_vec());

    let snap4 = h.memory_slots.queue_snapshot(tenant, ids[3]).await.unwrap();
    let snap5 = h.memory_slots.queue_snapshot(tenant, ids[4]).await.unwrap();
    assert_eq!(snap4.position, Some(1));
    assert_eq!(snap5.position, Some(2));
    assert_eq!(snap5.length, 2);
}

#[tokio::test]
async fn duplicate_submit_creates_no_second_row() {
    let h = make_harness();
    let tenant = TenantId::new();

    let first = h
        .service
        .submit(tenant, "rec-dup", "https://provider/rec-dup")
        .await
        .unwrap();
    let id = job_id(&first);

    // Still queued in the database (worker has not run yet).
    let second = h
        .service
        .submit(tenant, "rec-dup", "https://provider/rec-dup")
        .await
        .unwrap();
    assert_eq!(second, SubmitOutcome::AlreadyQueued(id));
    assert_eq!(h.repo.row_count(), 1);

    // Same once the download is running.
    h.repo.mark_running(id).await.unwrap();
    let third = h
        .service
        .submit(tenant, "rec-dup", "https://provider/rec-dup")
        .await
        .unwrap();
    assert_eq!(third, SubmitOutcome::AlreadyActive(id));
    assert_eq!(h.repo.row_count(), 1);
}

#[tokio::test]
async fn cached_recording_short_circuits() {
    let h = make_harness();
    let tenant = TenantId::new();

    h.artifacts
        .put(tenant, "rec-done", Bytes::from_static(b"x"))
        .await
        .unwrap();
    let outcome = h
        .service
        .submit(tenant, "rec-done", "https://provider/rec-done")
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Cached);
    assert_eq!(h.repo.row_count(), 0);
}

#[tokio::test]
async fn completion_releases_slot_and_promotes_head() {
    let h = make_harness();
    let tenant = TenantId::new();

    let mut ids = Vec::new();
    for i in 0..5 {
        let outcome = h
            .service
            .submit(tenant, &format!("rec-{i}"), "https://provider/rec")
            .await
            .unwrap();
        ids.push(job_id(&outcome));
    }
    h.dispatcher.drain();

    // First download finishes; the head waiter must be promoted and
    // dispatched.
    h.worker.process(tenant, ids[0]).await;

    assert_eq!(h.repo.status_of(ids[0]), Some(DownloadStatus::Completed));
    let dispatched = h.dispatcher.drain();
    assert_eq!(dispatched, vec![(tenant, ids[3])]);

    let snap5 = h.memory_slots.queue_snapshot(tenant, ids[4]).await.unwrap();
    assert_eq!(snap5.position, Some(1));
    assert_eq!(snap5.length, 1);
}

#[tokio::test]
async fn worker_releases_exactly_once_on_every_exit_path() {
    let h = make_harness();
    let tenant = TenantId::new();

    // Success.
    let ok = job_id(
        &h.service
            .submit(tenant, "rec-ok", "https://provider/ok")
            .await
            .unwrap(),
    );
    h.worker.process(tenant, ok).await;
    assert_eq!(h.slots.release_count(ok), 1);
    assert_eq!(h.repo.status_of(ok), Some(DownloadStatus::Completed));

    // Recoverable failure.
    let transient = job_id(
        &h.service
            .submit(tenant, "rec-transient", "https://provider/t")
            .await
            .unwrap(),
    );
    h.fetcher
        .push(Err(FetchError::Recoverable("HTTP 503".into())));
    h.worker.process(tenant, transient).await;
    assert_eq!(h.slots.release_count(transient), 1);
    assert_eq!(h.repo.status_of(transient), Some(DownloadStatus::Failed));

    // Fatal failure.
    let fatal = job_id(
        &h.service
            .submit(tenant, "rec-fatal", "https://provider/f")
            .await
            .unwrap(),
    );
    h.fetcher.push(Err(FetchError::Fatal("HTTP 404".into())));
    h.worker.process(tenant, fatal).await;
    assert_eq!(h.slots.release_count(fatal), 1);
    assert_eq!(h.repo.status_of(fatal), Some(DownloadStatus::Failed));
    assert!(h.budget.is_exhausted(tenant, "rec-fatal").await.unwrap());

    // Cancelled before the worker got to it.
    let cancelled = job_id(
        &h.service
            .submit(tenant, "rec-cancel", "https://provider/c")
            .await
            .unwrap(),
    );
    h.service.request_cancel(tenant, cancelled).await.unwrap();
    h.worker.process(tenant, cancelled).await;
    // One release from the cancel path, one from the worker.
    assert_eq!(h.slots.release_count(cancelled), 2);
    assert_eq!(h.repo.status_of(cancelled), Some(DownloadStatus::Cancelled));

    // Missing row.
    let ghost = DownloadJobId::new();
    h.worker.process(tenant, ghost).await;
    assert_eq!(h.slots.release_count(ghost), 1);
}

#[tokio::test]
async fn crashed_holder_is_swept_and_capacity_reused() {
    let h = make_harness();
    let tenant = TenantId::new();

    let mut ids = Vec::new();
    for i in 0..4 {
        let outcome = h
            .service
            .submit(tenant, &format!("rec-{i}"), "https://provider/rec")
            .await
            .unwrap();
        ids.push(job_id(&outcome));
    }
    h.dispatcher.drain();

    // Simulate a crashed worker: its liveness marker expires.
    h.memory_slots.expire_marker(tenant, ids[0]).await;
    assert_eq!(h.memory_slots.sweep(tenant).await.unwrap(), 1);

    // A new submission takes the reclaimed capacity immediately.
    let fresh = h
        .service
        .submit(tenant, "rec-fresh", "https://provider/fresh")
        .await
        .unwrap();
    let fresh_id = job_id(&fresh);
    let dispatched = h.dispatcher.drain();
    assert_eq!(dispatched, vec![(tenant, fresh_id)]);

    // The parked waiter is promoted by the next completion as usual.
    h.worker.process(tenant, ids[1]).await;
    let dispatched = h.dispatcher.drain();
    assert_eq!(dispatched, vec![(tenant, ids[3])]);
}

#[tokio::test]
async fn stuck_jobs_spend_budget_until_submit_fail_fasts() {
    let h = make_harness();
    let tenant = TenantId::new();

    for _ in 0..3 {
        let outcome = h
            .service
            .submit(tenant, "rec-stuck", "https://provider/stuck")
            .await
            .unwrap();
        let id = job_id(&outcome);
        h.dispatcher.drain();

        // The job sits queued past the threshold without a worker.
        h.repo.backdate(id, Duration::seconds(600));
        assert_eq!(h.monitor.sweep(Some(tenant)).await.unwrap(), 1);
        assert_eq!(h.repo.status_of(id), Some(DownloadStatus::Failed));
        // The wedged job's slot is freed for the next round.
        h.slots.release(tenant, id).await.unwrap();
    }

    // Third stuck cycle spent the budget; the gate now fail-fasts.
    let outcome = h
        .service
        .submit(tenant, "rec-stuck", "https://provider/stuck")
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Offline { .. }));
    assert_eq!(h.repo.row_count(), 3);

    // Other recordings for the tenant are unaffected.
    let other = h
        .service
        .submit(tenant, "rec-healthy", "https://provider/h")
        .await
        .unwrap();
    assert!(matches!(other, SubmitOutcome::Enqueued(_)));
}

#[tokio::test]
async fn cancel_before_start_releases_queue_entry() {
    let h = make_harness();
    let tenant = TenantId::new();

    let mut ids = Vec::new();
    for i in 0..4 {
        let outcome = h
            .service
            .submit(tenant, &format!("rec-{i}"), "https://provider/rec")
            .await
            .unwrap();
        ids.push(job_id(&outcome));
    }
    h.dispatcher.drain();

    // Cancel the parked job; its queue entry disappears immediately.
    let outcome = h.service.request_cancel(tenant, ids[3]).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Ok);
    assert_eq!(h.repo.status_of(ids[3]), Some(DownloadStatus::Cancelled));
    let snapshot = h.memory_slots.queue_snapshot(tenant, ids[3]).await.unwrap();
    assert_eq!(snapshot.length, 0);

    // Cancelling again reports the terminal state.
    let again = h.service.request_cancel(tenant, ids[3]).await.unwrap();
    assert_eq!(again, CancelOutcome::AlreadyFinished);

    // Unknown job and foreign tenant both come back NotFound.
    let missing = h
        .service
        .request_cancel(tenant, DownloadJobId::new())
        .await
        .unwrap();
    assert_eq!(missing, CancelOutcome::NotFound);
    let foreign = h
        .service
        .request_cancel(TenantId::new(), ids[0])
        .await
        .unwrap();
    assert_eq!(foreign, CancelOutcome::NotFound);
}

#[tokio::test]
async fn cancel_of_running_job_is_flag_only() {
    let h = make_harness();
    let tenant = TenantId::new();

    let id = job_id(
        &h.service
            .submit(tenant, "rec-run", "https://provider/run")
            .await
            .unwrap(),
    );
    h.repo.mark_running(id).await.unwrap();

    let outcome = h.service.request_cancel(tenant, id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Ok);
    // Still running; only the flag was set, and no release happened yet.
    assert_eq!(h.repo.status_of(id), Some(DownloadStatus::Running));
    assert_eq!(h.slots.release_count(id), 0);
}

#[tokio::test]
async fn status_progresses_from_unknown_to_ready() {
    let h = make_harness();
    let tenant = TenantId::new();

    assert_eq!(
        h.service.get_status(tenant, "rec-x").await.unwrap(),
        StatusReport::Unknown
    );

    // Fill all slots so the probe job lands in the wait queue.
    for i in 0..3 {
        h.service
            .submit(tenant, &format!("filler-{i}"), "https://provider/f")
            .await
            .unwrap();
    }
    let id = job_id(
        &h.service
            .submit(tenant, "rec-x", "https://provider/rec-x")
            .await
            .unwrap(),
    );
    h.dispatcher.drain();

    assert_eq!(
        h.service.get_status(tenant, "rec-x").await.unwrap(),
        StatusReport::Queued {
            position: Some(1),
            length: 1
        }
    );

    h.repo.mark_running(id).await.unwrap();
    assert_eq!(
        h.service.get_status(tenant, "rec-x").await.unwrap(),
        StatusReport::Processing
    );

    h.repo.mark_completed(id, "mem://done").await.unwrap();
    h.artifacts
        .put(tenant, "rec-x", Bytes::from_static(b"x"))
        .await
        .unwrap();
    assert_eq!(
        h.service.get_status(tenant, "rec-x").await.unwrap(),
        StatusReport::Ready
    );
}

#[tokio::test]
async fn failed_status_reports_offline_when_budget_spent() {
    let h = make_harness();
    let tenant = TenantId::new();

    let id = job_id(
        &h.service
            .submit(tenant, "rec-bad", "https://provider/bad")
            .await
            .unwrap(),
    );
    h.dispatcher.drain();
    h.fetcher.push(Err(FetchError::Fatal("HTTP 410".into())));
    h.worker.process(tenant, id).await;

    let status = h.service.get_status(tenant, "rec-bad").await.unwrap();
    match status {
        StatusReport::Failed { reason, offline } => {
            assert!(reason.unwrap().contains("HTTP 410"));
            assert!(offline);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn coordination_outage_honors_fail_open_flag() {
    let tenant = TenantId::new();
    let repo = Arc::new(InMemoryJobRepository::default());
    let artifacts = Arc::new(MemoryArtifactStore::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let cache = Arc::new(MemoryCacheProvider::new(
        &MemoryCacheConfig {
            max_capacity: 1000,
            time_to_live_seconds: 600,
        },
        600,
    ));
    let budget = RetryBudget::new(cache, &MonitorConfig::default());

    // Fail-open: the job is admitted and dispatched without a slot.
    let open = RecordingService::new(
        repo.clone(),
        Arc::new(OutageAllocator),
        artifacts.clone(),
        dispatcher.clone(),
        budget.clone(),
        true,
    );
    let outcome = open
        .submit(tenant, "rec-open", "https://provider/open")
        .await
        .unwrap();
    let id = job_id(&outcome);
    assert_eq!(dispatcher.drain(), vec![(tenant, id)]);
    assert_eq!(repo.status_of(id), Some(DownloadStatus::Queued));

    // Fail-closed: the row is marked failed and admission is refused.
    let closed = RecordingService::new(
        repo.clone(),
        Arc::new(OutageAllocator),
        artifacts.clone(),
        dispatcher.clone(),
        budget.clone(),
        false,
    );
    let outcome = closed
        .submit(tenant, "rec-closed", "https://provider/closed")
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
    assert!(dispatcher.drain().is_empty());

    let row = repo
        .find_latest_by_key(tenant, "rec-closed")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, DownloadStatus::Failed);
    assert!(row
        .error_message
        .unwrap()
        .contains("slot coordination unavailable"));
}

#[tokio::test]
async fn list_active_is_tenant_scoped() {
    let h = make_harness();
    let tenant_a = TenantId::new();
    let tenant_b = TenantId::new();

    for i in 0..2 {
        h.service
            .submit(tenant_a, &format!("a-{i}"), "https://provider/a")
            .await
            .unwrap();
    }
    h.service
        .submit(tenant_b, "b-0", "https://provider/b")
        .await
        .unwrap();

    let active_a = h.service.list_active(tenant_a).await.unwrap();
    assert_eq!(active_a.len(), 2);
    assert!(active_a.iter().all(|j| j.tenant_id == tenant_a));
    let active_b = h.service.list_active(tenant_b).await.unwrap();
    assert_eq!(active_b.len(), 1);
}
