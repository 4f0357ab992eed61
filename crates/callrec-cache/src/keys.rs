//! Cache and coordination key builders for all Callrec entries.
//!
//! Centralising key construction prevents typos and makes it easy
//! to find every key the application uses. Slot coordination keys
//! (slot sets, liveness markers, wait queues) live here too so that
//! the Lua scripts and the sweeper agree on the exact layout.

use callrec_core::types::id::{DownloadJobId, TenantId};

/// Prefix applied to all Callrec keys.
const PREFIX: &str = "callrec";

// ── Slot coordination keys ─────────────────────────────────

/// Set of job ids currently holding a download slot for a tenant.
pub fn slot_set(tenant_id: TenantId) -> String {
    format!("{PREFIX}:slots:{tenant_id}")
}

/// Liveness marker for a job occupying a slot. Expires on its own when
/// the owning worker dies, which is what lets the sweeper reclaim the
/// slot.
pub fn inflight_marker(tenant_id: TenantId, job_id: DownloadJobId) -> String {
    format!("{PREFIX}:inflight:{tenant_id}:{job_id}")
}

/// Prefix under which all liveness markers of a tenant live. The
/// acquire/release scripts concatenate the job id onto this to probe
/// marker existence for each slot member.
pub fn inflight_marker_prefix(tenant_id: TenantId) -> String {
    format!("{PREFIX}:inflight:{tenant_id}:")
}

/// SCAN pattern matching every tenant's slot set.
pub fn slot_set_pattern() -> String {
    format!("{PREFIX}:slots:*")
}

/// FIFO wait queue (list) of job ids waiting for a slot.
pub fn wait_queue(tenant_id: TenantId) -> String {
    format!("{PREFIX}:waitq:{tenant_id}")
}

/// Membership set mirroring the wait queue, for O(1) duplicate checks.
pub fn wait_set(tenant_id: TenantId) -> String {
    format!("{PREFIX}:waitset:{tenant_id}")
}

// ── Retry budget keys ──────────────────────────────────────

/// Failure counter for a recording within the rolling retry window.
pub fn retry_budget(tenant_id: TenantId, recording_key: &str) -> String {
    format!("{PREFIX}:retry:{tenant_id}:{recording_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_slot_set_key() {
        let tenant = TenantId::from(Uuid::nil());
        assert_eq!(
            slot_set(tenant),
            "callrec:slots:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_marker_prefix_composes_with_job_id() {
        let tenant = TenantId::from(Uuid::nil());
        let job = DownloadJobId::from(Uuid::nil());
        assert_eq!(
            inflight_marker(tenant, job),
            format!("{}{}", inflight_marker_prefix(tenant), job)
        );
    }

    #[test]
    fn test_slot_set_pattern_matches_slot_sets() {
        let tenant = TenantId::from(Uuid::nil());
        let prefix = slot_set_pattern();
        let prefix = prefix.trim_end_matches('*');
        assert!(slot_set(tenant).starts_with(prefix));
        assert!(!wait_queue(tenant).starts_with(prefix));
    }

    #[test]
    fn test_retry_budget_key() {
        let tenant = TenantId::from(Uuid::nil());
        assert_eq!(
            retry_budget(tenant, "rec-42"),
            "callrec:retry:00000000-0000-0000-0000-000000000000:rec-42"
        );
    }
}
