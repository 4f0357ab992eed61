//! Rolling retry budget per (tenant, recording).
//!
//! Failures are counted in the cache with a windowed TTL. Once the
//! budget is spent, the submit gate fail-fasts with an `Offline` outcome
//! instead of feeding more work to an upstream that keeps eating jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use callrec_cache::keys;
use callrec_core::config::monitor::MonitorConfig;
use callrec_core::result::AppResult;
use callrec_core::traits::cache::CacheProvider;
use callrec_core::types::id::TenantId;

/// Windowed failure counter backed by the cache provider.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    cache: Arc<dyn CacheProvider>,
    max_attempts: u32,
    window: Duration,
}

impl RetryBudget {
    /// Create a budget from monitor configuration.
    pub fn new(cache: Arc<dyn CacheProvider>, config: &MonitorConfig) -> Self {
        Self {
            cache,
            max_attempts: config.max_retry_attempts,
            window: Duration::from_secs(config.retry_window_seconds),
        }
    }

    /// Count one failure. The window starts at the first failure and is
    /// not extended by later ones. Returns the failure count so far.
    pub async fn record_failure(
        &self,
        tenant_id: TenantId,
        recording_key: &str,
    ) -> AppResult<u32> {
        let key = keys::retry_budget(tenant_id, recording_key);
        let count = self.cache.incr(&key).await?;
        if count == 1 {
            self.cache.expire(&key, self.window).await?;
        }
        if count as u32 >= self.max_attempts {
            warn!(%tenant_id, recording_key, count, "Retry budget exhausted");
        }
        Ok(count.max(0) as u32)
    }

    /// Spend the whole budget at once (fatal upstream rejections).
    pub async fn exhaust(&self, tenant_id: TenantId, recording_key: &str) -> AppResult<()> {
        let key = keys::retry_budget(tenant_id, recording_key);
        self.cache
            .set(&key, &self.max_attempts.to_string(), self.window)
            .await?;
        warn!(%tenant_id, recording_key, "Retry budget spent on fatal failure");
        Ok(())
    }

    /// Whether the budget for this recording is spent.
    pub async fn is_exhausted(&self, tenant_id: TenantId, recording_key: &str) -> AppResult<bool> {
        let key = keys::retry_budget(tenant_id, recording_key);
        let count = match self.cache.get(&key).await? {
            Some(raw) => raw.parse::<u32>().unwrap_or(0),
            None => 0,
        };
        Ok(count >= self.max_attempts)
    }

    /// Forget recorded failures after a success.
    pub async fn clear(&self, tenant_id: TenantId, recording_key: &str) -> AppResult<()> {
        let key = keys::retry_budget(tenant_id, recording_key);
        self.cache.delete(&key).await?;
        debug!(%tenant_id, recording_key, "Retry budget cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callrec_cache::memory::MemoryCacheProvider;
    use callrec_core::config::cache::MemoryCacheConfig;

    fn make_budget() -> RetryBudget {
        let cache = MemoryCacheProvider::new(
            &MemoryCacheConfig {
                max_capacity: 1000,
                time_to_live_seconds: 600,
            },
            600,
        );
        RetryBudget::new(
            Arc::new(cache),
            &MonitorConfig {
                max_retry_attempts: 3,
                retry_window_seconds: 600,
                ..MonitorConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let budget = make_budget();
        let tenant = TenantId::new();

        assert!(!budget.is_exhausted(tenant, "rec-1").await.unwrap());
        budget.record_failure(tenant, "rec-1").await.unwrap();
        budget.record_failure(tenant, "rec-1").await.unwrap();
        assert!(!budget.is_exhausted(tenant, "rec-1").await.unwrap());
        budget.record_failure(tenant, "rec-1").await.unwrap();
        assert!(budget.is_exhausted(tenant, "rec-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_fatal_exhausts_immediately() {
        let budget = make_budget();
        let tenant = TenantId::new();

        budget.exhaust(tenant, "rec-2").await.unwrap();
        assert!(budget.is_exhausted(tenant, "rec-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_restores_budget() {
        let budget = make_budget();
        let tenant = TenantId::new();

        budget.exhaust(tenant, "rec-3").await.unwrap();
        budget.clear(tenant, "rec-3").await.unwrap();
        assert!(!budget.is_exhausted(tenant, "rec-3").await.unwrap());
    }

    #[tokio::test]
    async fn test_window_expiry_resets_failure_count() {
        let cache = MemoryCacheProvider::new(
            &MemoryCacheConfig {
                max_capacity: 1000,
                time_to_live_seconds: 600,
            },
            600,
        );
        let budget = RetryBudget::new(
            Arc::new(cache),
            &MonitorConfig {
                max_retry_attempts: 3,
                retry_window_seconds: 1,
                ..MonitorConfig::default()
            },
        );
        let tenant = TenantId::new();

        for _ in 0..3 {
            budget.record_failure(tenant, "rec-w").await.unwrap();
        }
        assert!(budget.is_exhausted(tenant, "rec-w").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!budget.is_exhausted(tenant, "rec-w").await.unwrap());

        // A failure after a quiet window starts a fresh count instead of
        // resuming the old one.
        let count = budget.record_failure(tenant, "rec-w").await.unwrap();
        assert_eq!(count, 1);
        assert!(!budget.is_exhausted(tenant, "rec-w").await.unwrap());
    }

    #[tokio::test]
    async fn test_recordings_are_independent() {
        let budget = make_budget();
        let tenant = TenantId::new();

        budget.exhaust(tenant, "rec-4").await.unwrap();
        assert!(!budget.is_exhausted(tenant, "rec-5").await.unwrap());
    }
}
