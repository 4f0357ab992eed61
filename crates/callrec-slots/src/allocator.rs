//! Slot allocator trait and shared types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use callrec_core::config::slots::SlotConfig;
use callrec_core::error::AppError;
use callrec_core::result::AppResult;
use callrec_core::types::id::{DownloadJobId, TenantId};

/// Result of attempting to acquire a download slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireOutcome {
    /// A slot was granted; the job may start downloading now.
    Acquired,
    /// All slots are busy; the job was appended to the wait queue.
    Queued {
        /// 1-based position in the wait queue.
        position: u64,
    },
    /// The job already holds a slot with a live marker.
    AlreadyInFlight,
    /// The job is already parked in the wait queue.
    AlreadyQueued,
}

/// Point-in-time view of a tenant's wait queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Number of jobs currently waiting.
    pub length: u64,
    /// 1-based position of the inspected job, if it is waiting.
    pub position: Option<u64>,
}

/// Trait for atomic slot acquisition and release with FIFO overflow.
///
/// Implementations must be thread-safe and keep three guarantees:
/// a tenant never holds more than `max_slots_per_tenant` slots, a job id
/// appears at most once across the slot set and the wait queue, and the
/// wait queue is promoted strictly in arrival order.
#[async_trait]
pub trait SlotAllocator: Send + Sync + std::fmt::Debug {
    /// Attempt to acquire a slot for the job, queueing it on overflow.
    ///
    /// Stale slot holders (members whose liveness marker expired) are
    /// evicted inline before capacity is judged, so a crashed worker can
    /// never wedge a tenant permanently.
    async fn try_acquire(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<AcquireOutcome>;

    /// Release the job's slot (or remove it from the wait queue) and
    /// promote the wait-queue head into the freed slot.
    ///
    /// Returns the promoted job id, which the caller must dispatch.
    /// Releasing a job that holds nothing is a no-op.
    async fn release(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<Option<DownloadJobId>>;

    /// Evict markerless slot members for one tenant. Returns the number
    /// of slots reclaimed. Never promotes waiters; the next
    /// acquire/release cycle picks them up.
    async fn sweep(&self, tenant_id: TenantId) -> AppResult<u64>;

    /// Evict markerless slot members across all tenants.
    async fn sweep_all(&self) -> AppResult<u64>;

    /// Read the wait-queue length and the job's position, if waiting.
    /// Non-atomic; intended for the status surface only.
    async fn queue_snapshot(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<QueueSnapshot>;
}

use crate::memory::MemorySlotAllocator;
#[cfg(feature = "redis-slots")]
use crate::redis::RedisSlotAllocator;

/// Dispatcher for slot allocation backends.
///
/// Switches between in-memory and Redis-based allocation based on
/// configuration.
#[derive(Debug, Clone)]
pub enum SlotAllocatorDispatch {
    /// In-memory allocator (single node).
    Memory(MemorySlotAllocator),
    /// Redis-based allocator (multi-node).
    #[cfg(feature = "redis-slots")]
    Redis(RedisSlotAllocator),
}

impl SlotAllocatorDispatch {
    /// Create the allocator selected by configuration.
    pub async fn new(config: &SlotConfig) -> AppResult<Self> {
        match config.provider.as_str() {
            #[cfg(feature = "redis-slots")]
            "redis" => Ok(Self::Redis(RedisSlotAllocator::connect(config).await?)),
            "memory" => Ok(Self::Memory(MemorySlotAllocator::new(config))),
            other => Err(AppError::configuration(format!(
                "Unknown slot provider: '{other}'. Supported: memory, redis"
            ))),
        }
    }
}

#[async_trait]
impl SlotAllocator for SlotAllocatorDispatch {
    async fn try_acquire(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<AcquireOutcome> {
        match self {
            Self::Memory(inner) => inner.try_acquire(tenant_id, job_id).await,
            #[cfg(feature = "redis-slots")]
            Self::Redis(inner) => inner.try_acquire(tenant_id, job_id).await,
        }
    }

    async fn release(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<Option<DownloadJobId>> {
        match self {
            Self::Memory(inner) => inner.release(tenant_id, job_id).await,
            #[cfg(feature = "redis-slots")]
            Self::Redis(inner) => inner.release(tenant_id, job_id).await,
        }
    }

    async fn sweep(&self, tenant_id: TenantId) -> AppResult<u64> {
        match self {
            Self::Memory(inner) => inner.sweep(tenant_id).await,
            #[cfg(feature = "redis-slots")]
            Self::Redis(inner) => inner.sweep(tenant_id).await,
        }
    }

    async fn sweep_all(&self) -> AppResult<u64> {
        match self {
            Self::Memory(inner) => inner.sweep_all().await,
            #[cfg(feature = "redis-slots")]
            Self::Redis(inner) => inner.sweep_all().await,
        }
    }

    async fn queue_snapshot(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<QueueSnapshot> {
        match self {
            Self::Memory(inner) => inner.queue_snapshot(tenant_id, job_id).await,
            #[cfg(feature = "redis-slots")]
            Self::Redis(inner) => inner.queue_snapshot(tenant_id, job_id).await,
        }
    }
}
