//! In-memory cache implementation using the moka crate.
//!
//! Plain string entries live in moka under its cache-level TTL. Numeric
//! entries (retry-budget counters) live in a separate map with a
//! per-entry deadline so that `incr`/`expire`/`set` keep Redis counter
//! semantics: the window set by `expire` really does evict the count,
//! and `set` overwrites whatever count was there.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;

use callrec_core::config::cache::MemoryCacheConfig;
use callrec_core::result::AppResult;
use callrec_core::traits::cache::CacheProvider;

/// A counter value with an optional expiry deadline.
#[derive(Debug)]
struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= Instant::now())
    }
}

/// In-memory cache provider using moka.
#[derive(Debug, Clone)]
pub struct MemoryCacheProvider {
    /// The underlying moka cache for string entries.
    cache: Cache<String, String>,
    /// Default TTL for entries.
    default_ttl: Duration,
    /// Counters stored separately with per-entry deadlines.
    counters: Arc<dashmap::DashMap<String, CounterEntry>>,
}

impl MemoryCacheProvider {
    /// Create a new in-memory cache from configuration.
    pub fn new(config: &MemoryCacheConfig, default_ttl_seconds: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.time_to_live_seconds))
            .build();

        Self {
            cache,
            default_ttl: Duration::from_secs(default_ttl_seconds),
            counters: Arc::new(dashmap::DashMap::new()),
        }
    }

    /// Default TTL applied when callers have no specific window.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read a counter, lazily evicting it when its deadline passed.
    fn live_counter(&self, key: &str) -> Option<i64> {
        self.counters.remove_if(key, |_, entry| entry.is_expired());
        self.counters.get(key).map(|entry| entry.value)
    }
}

#[async_trait]
impl CacheProvider for MemoryCacheProvider {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        if let Some(value) = self.live_counter(key) {
            return Ok(Some(value.to_string()));
        }
        Ok(self.cache.get(key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        // A key holds either a counter or a string, never both.
        match value.parse::<i64>() {
            Ok(n) => {
                self.cache.remove(key).await;
                self.counters.insert(
                    key.to_string(),
                    CounterEntry {
                        value: n,
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
            }
            Err(_) => {
                // moka sets TTL at cache level, not per-entry in the simple API.
                self.counters.remove(key);
                self.cache.insert(key.to_string(), value.to_string()).await;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.cache.remove(key).await;
        self.counters.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        Ok(self.live_counter(key).is_some() || self.cache.contains_key(key))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        // moka doesn't have native set-if-not-exists so we use get-then-insert.
        // This is not perfectly atomic but acceptable for in-memory single-node use.
        if self.exists(key).await? {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        self.counters.remove_if(key, |_, entry| entry.is_expired());
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                value: 0,
                expires_at: None,
            });
        entry.value += 1;
        Ok(entry.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        self.counters.remove_if(key, |_, entry| entry.is_expired());
        if let Some(mut entry) = self.counters.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        // moka doesn't support changing the TTL of an existing entry;
        // string entries expire at the cache-level TTL.
        Ok(self.cache.contains_key(key))
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }
}
