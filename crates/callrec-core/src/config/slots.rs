//! Per-tenant download slot and wait-queue configuration.

use serde::{Deserialize, Serialize};

/// Slot table / wait queue configuration.
///
/// These settings govern the per-tenant admission protocol: how many
/// downloads may run concurrently, how long a liveness marker protects a
/// slot holder, and how overflow entries age out of the wait queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Slot allocator backend: `"memory"` (single node) or `"redis"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Redis connection URL for the `redis` provider.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Maximum simultaneous downloads per tenant.
    #[serde(default = "default_max_slots")]
    pub max_slots_per_tenant: u32,
    /// TTL of a slot holder's liveness marker, in seconds. Should cover the
    /// longest plausible single download.
    #[serde(default = "default_liveness_ttl")]
    pub liveness_ttl_seconds: u64,
    /// TTL of wait-queue entries, in seconds. Abandoned entries self-clean
    /// after this long.
    #[serde(default = "default_wait_queue_ttl")]
    pub wait_queue_ttl_seconds: u64,
    /// Interval between background liveness sweeps, in seconds.
    #[serde(default = "default_sweeper_interval")]
    pub sweeper_interval_seconds: u64,
    /// When the coordination store is unreachable, admit downloads without a
    /// slot instead of rejecting them. Can transiently exceed the per-tenant
    /// cap during an outage.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            redis_url: default_redis_url(),
            max_slots_per_tenant: default_max_slots(),
            liveness_ttl_seconds: default_liveness_ttl(),
            wait_queue_ttl_seconds: default_wait_queue_ttl(),
            sweeper_interval_seconds: default_sweeper_interval(),
            fail_open: default_fail_open(),
        }
    }
}

fn default_provider() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_max_slots() -> u32 {
    3
}

fn default_liveness_ttl() -> u64 {
    900
}

fn default_wait_queue_ttl() -> u64 {
    1200
}

fn default_sweeper_interval() -> u64 {
    30
}

fn default_fail_open() -> bool {
    true
}
