//! Redis-based slot allocator using Lua scripts for atomicity.
//!
//! Suitable for multi-node deployments. The whole acquire decision
//! (dedup checks, inline sweep, grant-or-queue) happens in one script so
//! that concurrent submitters across processes can never over-grant a
//! tenant; release-plus-promotion is likewise a single script so the
//! freed slot and the promoted waiter change hands atomically.

use std::str::FromStr;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use callrec_cache::keys;
use callrec_core::config::slots::SlotConfig;
use callrec_core::error::{AppError, ErrorKind};
use callrec_core::result::AppResult;
use callrec_core::types::id::{DownloadJobId, TenantId};

use crate::allocator::{AcquireOutcome, QueueSnapshot, SlotAllocator};

/// Lua script for atomic slot acquisition.
///
/// KEYS[1] = slot set
/// KEYS[2] = wait queue (list)
/// KEYS[3] = wait set
/// ARGV[1] = job id
/// ARGV[2] = liveness marker key prefix (marker key = prefix .. job id)
/// ARGV[3] = max slots per tenant
/// ARGV[4] = liveness marker TTL seconds
/// ARGV[5] = wait queue TTL seconds
///
/// Returns { status, position } where status is one of
/// "acquired" | "queued" | "inflight" | "waiting".
const ACQUIRE_SCRIPT: &str = r#"
    local slot_key = KEYS[1]
    local queue_key = KEYS[2]
    local wait_key = KEYS[3]
    local job_id = ARGV[1]
    local marker_prefix = ARGV[2]
    local max_slots = tonumber(ARGV[3])
    local marker_ttl = tonumber(ARGV[4])
    local queue_ttl = tonumber(ARGV[5])

    -- Already holding a slot with a live marker?
    if redis.call('SISMEMBER', slot_key, job_id) == 1 then
        if redis.call('EXISTS', marker_prefix .. job_id) == 1 then
            return { 'inflight', 0 }
        end
        -- Stale self-entry from a crashed run; evict and fall through.
        redis.call('SREM', slot_key, job_id)
    end

    -- Already parked in the wait queue?
    if redis.call('SISMEMBER', wait_key, job_id) == 1 then
        local position = 0
        local waiting = redis.call('LRANGE', queue_key, 0, -1)
        for i, id in ipairs(waiting) do
            if id == job_id then
                position = i
                break
            end
        end
        return { 'waiting', position }
    end

    -- Evict members whose liveness marker expired before judging capacity.
    local members = redis.call('SMEMBERS', slot_key)
    for _, id in ipairs(members) do
        if redis.call('EXISTS', marker_prefix .. id) == 0 then
            redis.call('SREM', slot_key, id)
        end
    end

    if redis.call('SCARD', slot_key) < max_slots then
        redis.call('SADD', slot_key, job_id)
        redis.call('SET', marker_prefix .. job_id, '1', 'EX', marker_ttl)
        return { 'acquired', 0 }
    end

    redis.call('RPUSH', queue_key, job_id)
    redis.call('SADD', wait_key, job_id)
    redis.call('EXPIRE', queue_key, queue_ttl)
    redis.call('EXPIRE', wait_key, queue_ttl)
    return { 'queued', redis.call('LLEN', queue_key) }
"#;

/// Lua script for atomic slot release plus FIFO promotion.
///
/// KEYS/ARGV as in the acquire script (without the queue TTL).
/// Returns the promoted job id, or false when nothing was promoted.
const RELEASE_SCRIPT: &str = r#"
    local slot_key = KEYS[1]
    local queue_key = KEYS[2]
    local wait_key = KEYS[3]
    local job_id = ARGV[1]
    local marker_prefix = ARGV[2]
    local max_slots = tonumber(ARGV[3])
    local marker_ttl = tonumber(ARGV[4])

    redis.call('SREM', slot_key, job_id)
    redis.call('DEL', marker_prefix .. job_id)
    -- The releasing job may have been parked rather than holding a slot
    -- (cancelled while waiting); clear it from the queue too.
    redis.call('LREM', queue_key, 0, job_id)
    redis.call('SREM', wait_key, job_id)

    if redis.call('SCARD', slot_key) >= max_slots then
        return false
    end

    local head = redis.call('LPOP', queue_key)
    if not head then
        return false
    end

    redis.call('SREM', wait_key, head)
    redis.call('SADD', slot_key, head)
    redis.call('SET', marker_prefix .. head, '1', 'EX', marker_ttl)
    return head
"#;

/// Lua script evicting markerless slot members. Returns eviction count.
const SWEEP_SCRIPT: &str = r#"
    local slot_key = KEYS[1]
    local marker_prefix = ARGV[1]
    local removed = 0
    for _, id in ipairs(redis.call('SMEMBERS', slot_key)) do
        if redis.call('EXISTS', marker_prefix .. id) == 0 then
            redis.call('SREM', slot_key, id)
            removed = removed + 1
        end
    end
    return removed
"#;

/// Redis-based slot allocator for multi-node deployments.
#[derive(Debug, Clone)]
pub struct RedisSlotAllocator {
    /// Redis connection manager (pooled, reconnecting).
    conn: redis::aio::ConnectionManager,
    /// Maximum simultaneous downloads per tenant.
    max_slots: u32,
    /// Liveness marker TTL in seconds.
    liveness_ttl: u64,
    /// Wait queue entry TTL in seconds.
    wait_queue_ttl: u64,
}

impl RedisSlotAllocator {
    /// Create a new Redis-based slot allocator from configuration.
    pub async fn connect(config: &SlotConfig) -> AppResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| Self::map_err("Failed to create Redis client", e))?;

        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Self::map_err("Failed to connect to Redis", e))?;

        info!(
            max_slots = config.max_slots_per_tenant,
            liveness_ttl = config.liveness_ttl_seconds,
            "Redis slot allocator initialized"
        );

        Ok(Self {
            conn,
            max_slots: config.max_slots_per_tenant,
            liveness_ttl: config.liveness_ttl_seconds,
            wait_queue_ttl: config.wait_queue_ttl_seconds,
        })
    }

    fn map_err(message: &str, e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Coordination, message.to_string(), e)
    }

    fn parse_job_id(raw: &str) -> AppResult<DownloadJobId> {
        DownloadJobId::from_str(raw).map_err(|e| {
            AppError::with_source(
                ErrorKind::Coordination,
                format!("Slot store returned a malformed job id: '{raw}'"),
                e,
            )
        })
    }
}

#[async_trait]
impl SlotAllocator for RedisSlotAllocator {
    async fn try_acquire(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<AcquireOutcome> {
        let mut conn = self.conn.clone();

        let (status, position): (String, i64) = redis::Script::new(ACQUIRE_SCRIPT)
            .key(keys::slot_set(tenant_id))
            .key(keys::wait_queue(tenant_id))
            .key(keys::wait_set(tenant_id))
            .arg(job_id.to_string())
            .arg(keys::inflight_marker_prefix(tenant_id))
            .arg(self.max_slots)
            .arg(self.liveness_ttl)
            .arg(self.wait_queue_ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("Slot acquire script failed", e))?;

        match status.as_str() {
            "acquired" => {
                debug!(%tenant_id, %job_id, "Slot acquired");
                Ok(AcquireOutcome::Acquired)
            }
            "queued" => {
                debug!(%tenant_id, %job_id, position, "Slots full, job queued");
                Ok(AcquireOutcome::Queued {
                    position: position.max(1) as u64,
                })
            }
            "inflight" => {
                warn!(%tenant_id, %job_id, "Acquire for a job already holding a slot");
                Ok(AcquireOutcome::AlreadyInFlight)
            }
            "waiting" => {
                warn!(%tenant_id, %job_id, "Acquire for a job already in the wait queue");
                Ok(AcquireOutcome::AlreadyQueued)
            }
            other => Err(AppError::coordination(format!(
                "Unexpected slot acquire result: {other}"
            ))),
        }
    }

    async fn release(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<Option<DownloadJobId>> {
        let mut conn = self.conn.clone();

        let promoted: Option<String> = redis::Script::new(RELEASE_SCRIPT)
            .key(keys::slot_set(tenant_id))
            .key(keys::wait_queue(tenant_id))
            .key(keys::wait_set(tenant_id))
            .arg(job_id.to_string())
            .arg(keys::inflight_marker_prefix(tenant_id))
            .arg(self.max_slots)
            .arg(self.liveness_ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("Slot release script failed", e))?;

        match promoted {
            Some(raw) => {
                let next = Self::parse_job_id(&raw)?;
                debug!(%tenant_id, %job_id, promoted = %next, "Slot released, waiter promoted");
                Ok(Some(next))
            }
            None => {
                debug!(%tenant_id, %job_id, "Slot released");
                Ok(None)
            }
        }
    }

    async fn sweep(&self, tenant_id: TenantId) -> AppResult<u64> {
        let mut conn = self.conn.clone();

        let removed: u64 = redis::Script::new(SWEEP_SCRIPT)
            .key(keys::slot_set(tenant_id))
            .arg(keys::inflight_marker_prefix(tenant_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("Slot sweep script failed", e))?;

        if removed > 0 {
            warn!(%tenant_id, removed, "Reclaimed slots from dead holders");
        }
        Ok(removed)
    }

    async fn sweep_all(&self) -> AppResult<u64> {
        let mut conn = self.conn.clone();

        // SCAN for all tenant slot sets, then sweep each one.
        let pattern = keys::slot_set_pattern();
        let mut slot_keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::map_err("Slot sweep scan failed", e))?;
            slot_keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut total = 0u64;
        for key in slot_keys {
            let Some(raw_tenant) = key.rsplit(':').next() else {
                continue;
            };
            let Ok(tenant_id) = TenantId::from_str(raw_tenant) else {
                warn!(key, "Skipping slot set with malformed tenant id");
                continue;
            };
            total += self.sweep(tenant_id).await?;
        }
        Ok(total)
    }

    async fn queue_snapshot(
        &self,
        tenant_id: TenantId,
        job_id: DownloadJobId,
    ) -> AppResult<QueueSnapshot> {
        let mut conn = self.conn.clone();
        let queue_key = keys::wait_queue(tenant_id);

        let length: u64 = redis::cmd("LLEN")
            .arg(&queue_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("Wait queue length read failed", e))?;

        let index: Option<u64> = redis::cmd("LPOS")
            .arg(&queue_key)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_err("Wait queue position read failed", e))?;

        Ok(QueueSnapshot {
            length,
            position: index.map(|i| i + 1),
        })
    }
}
