//! In-memory slot allocator using a Tokio mutex for single-node
//! deployments and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use callrec_core::config::slots::SlotConfig;
use callrec_core::result::AppResult;
use callrec_core::types::id::{DownloadJobId, TenantId};

use crate::allocator::{AcquireOutcome, QueueSnapshot, SlotAllocator};

/// Per-tenant slot and wait-queue state.
///
/// `Instant` deadlines stand in for the Redis TTLs: a holder whose
/// deadline passed counts as markerless, a queued entry whose deadline
/// passed is dropped on the next touch.
#[derive(Debug, Default)]
struct TenantSlots {
    /// Job ids holding a slot, with their liveness deadline.
    holders: HashMap<DownloadJobId, Instant>,
    /// Waiting job ids in arrival order, with their queue deadline.
    queue: VecDeque<(DownloadJobId, Instant)>,
}

impl TenantSlots {
    fn prune_queue(&mut self, now: Instant) {
        self.queue.retain(|(_, deadline)| *deadline > now);
    }

    fn sweep_holders(&mut self, now: Instant) -> u64 {
        let before = self.holders.len();
        self.holders.retain(|_, deadline| *deadline > now);
        (before - self.holders.len()) as u64
    }

    fn queue_position(&self, job_id: DownloadJobId) -> Option<u64> {
        self.queue
            .iter()
            .position(|(id, _)| *id == job_id)
            .map(|i| i as u64 + 1)
    }
}

/// In-memory slot allocator.
///
/// Suitable for single-node deployments only; the Redis allocator is the
/// authority whenever more than one process admits downloads.
#[derive(Debug, Clone)]
pub struct MemorySlotAllocator {
    state: Arc<Mutex<HashMap<TenantId, TenantSlots>>>,
    max_slots: usize,
    liveness_ttl: Duration,
    wait_queue_ttl: Duration,
}

impl MemorySlotAllocator {
    /// Create a new memory-based slot allocator from configuration.
    pub fn new(config: &SlotConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            max_slots: config.max_slots_per_tenant as usize,
            liveness_ttl: Duration::from_secs(config.liveness_ttl_seconds),
            wait_queue_ttl: Duration::from_secs(config.wait_queue_ttl_seconds),
        }
    }

    /// Expire a job's liveness marker immediately (test hook for the
    /// crash-recovery path).
    pub async fn expire_marker(&self, tenant_id: TenantId, job_id: DownloadJobId) {
        let mut state = self.state.lock().await;
        if let Some(slots) = state.get_mut(&tenant_id) {
            if let Some(deadline) = slots.holders.get_mut(&job_id) {
                *deadline = Instant::now() - Duration::from_secs(1);
            }
        }
    }
}

#[async_trait]
impl SlotAllocator for MemorySlotAllocator {
    async fn try_acquire(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<AcquireOutcome> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let slots = state.entry(tenant_id).or_default();
        slots.prune_queue(now);

        if let Some(deadline) = slots.holders.get(&job_id) {
            if *deadline > now {
                warn!(%tenant_id, %job_id, "Acquire for a job already holding a slot");
                return Ok(AcquireOutcome::AlreadyInFlight);
            }
            // Stale self-entry; evict and fall through.
            slots.holders.remove(&job_id);
        }

        if slots.queue_position(job_id).is_some() {
            warn!(%tenant_id, %job_id, "Acquire for a job already in the wait queue");
            return Ok(AcquireOutcome::AlreadyQueued);
        }

        slots.sweep_holders(now);

        if slots.holders.len() < self.max_slots {
            slots.holders.insert(job_id, now + self.liveness_ttl);
            debug!(%tenant_id, %job_id, "Slot acquired");
            return Ok(AcquireOutcome::Acquired);
        }

        slots.queue.push_back((job_id, now + self.wait_queue_ttl));
        let position = slots.queue.len() as u64;
        debug!(%tenant_id, %job_id, position, "Slots full, job queued");
        Ok(AcquireOutcome::Queued { position })
    }

    async fn release(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<Option<DownloadJobId>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(slots) = state.get_mut(&tenant_id) else {
            return Ok(None);
        };

        slots.holders.remove(&job_id);
        slots.queue.retain(|(id, _)| *id != job_id);
        slots.prune_queue(now);

        if slots.holders.len() >= self.max_slots {
            return Ok(None);
        }

        let Some((next, _)) = slots.queue.pop_front() else {
            return Ok(None);
        };
        slots.holders.insert(next, now + self.liveness_ttl);
        debug!(%tenant_id, %job_id, promoted = %next, "Slot released, waiter promoted");
        Ok(Some(next))
    }

    async fn sweep(&self, tenant_id: TenantId) -> AppResult<u64> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(slots) = state.get_mut(&tenant_id) else {
            return Ok(0);
        };
        let removed = slots.sweep_holders(now);
        if removed > 0 {
            warn!(%tenant_id, removed, "Reclaimed slots from dead holders");
        }
        Ok(removed)
    }

    async fn sweep_all(&self) -> AppResult<u64> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut total = 0u64;
        for slots in state.values_mut() {
            total += slots.sweep_holders(now);
        }
        Ok(total)
    }

    async fn queue_snapshot(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<QueueSnapshot> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(slots) = state.get_mut(&tenant_id) else {
            return Ok(QueueSnapshot {
                length: 0,
                position: None,
            });
        };
        slots.prune_queue(now);
        Ok(QueueSnapshot {
            length: slots.queue.len() as u64,
            position: slots.queue_position(job_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_allocator() -> MemorySlotAllocator {
        MemorySlotAllocator::new(&SlotConfig {
            max_slots_per_tenant: 3,
            ..SlotConfig::default()
        })
    }

    #[tokio::test]
    async fn test_capacity_then_fifo_queue() {
        let allocator = make_allocator();
        let tenant = TenantId::new();
        let jobs: Vec<DownloadJobId> = (0..5).map(|_| DownloadJobId::new()).collect();

        for job in &jobs[..3] {
            assert_eq!(
                allocator.try_acquire(tenant, *job).await.unwrap(),
                AcquireOutcome::Acquired
            );
        }
        assert_eq!(
            allocator.try_acquire(tenant, jobs[3]).await.unwrap(),
            AcquireOutcome::Queued { position: 1 }
        );
        assert_eq!(
            allocator.try_acquire(tenant, jobs[4]).await.unwrap(),
            AcquireOutcome::Queued { position: 2 }
        );
    }

    #[tokio::test]
    async fn test_duplicate_acquire_is_flagged() {
        let allocator = make_allocator();
        let tenant = TenantId::new();
        let job = DownloadJobId::new();

        allocator.try_acquire(tenant, job).await.unwrap();
        assert_eq!(
            allocator.try_acquire(tenant, job).await.unwrap(),
            AcquireOutcome::AlreadyInFlight
        );

        // Fill remaining slots, park a fourth job, then re-acquire it.
        for _ in 0..2 {
            allocator
                .try_acquire(tenant, DownloadJobId::new())
                .await
                .unwrap();
        }
        let waiting = DownloadJobId::new();
        allocator.try_acquire(tenant, waiting).await.unwrap();
        assert_eq!(
            allocator.try_acquire(tenant, waiting).await.unwrap(),
            AcquireOutcome::AlreadyQueued
        );
    }

    #[tokio::test]
    async fn test_release_promotes_queue_head() {
        let allocator = make_allocator();
        let tenant = TenantId::new();
        let jobs: Vec<DownloadJobId> = (0..5).map(|_| DownloadJobId::new()).collect();
        for job in &jobs {
            allocator.try_acquire(tenant, *job).await.unwrap();
        }

        let promoted = allocator.release(tenant, jobs[0]).await.unwrap();
        assert_eq!(promoted, Some(jobs[3]));

        // The remaining waiter moved up to the head.
        let snapshot = allocator.queue_snapshot(tenant, jobs[4]).await.unwrap();
        assert_eq!(snapshot.length, 1);
        assert_eq!(snapshot.position, Some(1));
    }

    #[tokio::test]
    async fn test_release_of_waiting_job_does_not_promote() {
        let allocator = make_allocator();
        let tenant = TenantId::new();
        let jobs: Vec<DownloadJobId> = (0..4).map(|_| DownloadJobId::new()).collect();
        for job in &jobs {
            allocator.try_acquire(tenant, *job).await.unwrap();
        }

        // Cancelling the parked job removes it without touching holders.
        let promoted = allocator.release(tenant, jobs[3]).await.unwrap();
        assert_eq!(promoted, None);
        let snapshot = allocator.queue_snapshot(tenant, jobs[3]).await.unwrap();
        assert_eq!(snapshot.length, 0);
    }

    #[tokio::test]
    async fn test_release_unknown_job_is_noop() {
        let allocator = make_allocator();
        let tenant = TenantId::new();
        let promoted = allocator
            .release(tenant, DownloadJobId::new())
            .await
            .unwrap();
        assert_eq!(promoted, None);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_marker() {
        let allocator = make_allocator();
        let tenant = TenantId::new();
        let jobs: Vec<DownloadJobId> = (0..4).map(|_| DownloadJobId::new()).collect();
        for job in &jobs {
            allocator.try_acquire(tenant, *job).await.unwrap();
        }

        allocator.expire_marker(tenant, jobs[1]).await;
        assert_eq!(allocator.sweep(tenant).await.unwrap(), 1);

        // The freed slot admits a new job directly; the waiter is promoted
        // by the next release as usual.
        assert_eq!(
            allocator
                .try_acquire(tenant, DownloadJobId::new())
                .await
                .unwrap(),
            AcquireOutcome::Acquired
        );
        let promoted = allocator.release(tenant, jobs[0]).await.unwrap();
        assert_eq!(promoted, Some(jobs[3]));
    }

    #[tokio::test]
    async fn test_stale_self_entry_reacquires() {
        let allocator = make_allocator();
        let tenant = TenantId::new();
        let job = DownloadJobId::new();

        allocator.try_acquire(tenant, job).await.unwrap();
        allocator.expire_marker(tenant, job).await;
        assert_eq!(
            allocator.try_acquire(tenant, job).await.unwrap(),
            AcquireOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let allocator = make_allocator();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();

        for _ in 0..3 {
            allocator
                .try_acquire(tenant_a, DownloadJobId::new())
                .await
                .unwrap();
        }
        // Tenant A is full; tenant B still gets slots.
        assert_eq!(
            allocator
                .try_acquire(tenant_b, DownloadJobId::new())
                .await
                .unwrap(),
            AcquireOutcome::Acquired
        );
    }
}
