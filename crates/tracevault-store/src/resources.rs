use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use tracevault_types::{EngineConfig, Result};

use crate::cache::{cache_key, CacheStats, ResultCache, StatementStats};
use crate::memory::{MemoryMonitor, PressureLevel};
use crate::pool::{ConnectionPool, PooledConnection};

/// Per-connection page-cache budget matching the cache_size pragma.
const CONNECTION_PAGE_CACHE_BYTES: u64 = 16 * 1024 * 1024;

/// Point-in-time resource metrics consumed by the performance monitor.
#[derive(Debug, Clone)]
pub struct ResourceMetrics {
    pub pool_open: usize,
    pub pool_idle: usize,
    pub pool_utilization: f64,
    pub cache: CacheStats,
    pub avg_statement_latency_ms: f64,
    pub memory_used_bytes: u64,
    pub pressure: PressureLevel,
}

/// Owns the connection pool, statement bookkeeping, result cache, and
/// memory monitor. Every component that touches the store goes through
/// this; it is the single shared-resource authority in the engine.
pub struct ResourceManager {
    config: EngineConfig,
    pool: Arc<ConnectionPool>,
    result_cache: ResultCache,
    statement_stats: StatementStats,
    memory: MemoryMonitor,
    /// Bytes reported by components outside this manager (stream buffers).
    external_bytes: AtomicU64,
}

impl ResourceManager {
    pub fn open(path: &Path, config: EngineConfig) -> Result<Arc<Self>> {
        let pool = ConnectionPool::open(path, config.clone())?;
        Ok(Self::with_pool(pool, config))
    }

    pub fn open_in_memory(config: EngineConfig) -> Result<Arc<Self>> {
        let pool = ConnectionPool::open_in_memory(config.clone())?;
        Ok(Self::with_pool(pool, config))
    }

    fn with_pool(pool: Arc<ConnectionPool>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            result_cache: ResultCache::new(&config),
            statement_stats: StatementStats::new(config.statement_cache_size),
            memory: MemoryMonitor::new(&config),
            external_bytes: AtomicU64::new(0),
            pool,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    /// Acquire a pooled connection, bounded by the configured timeout.
    pub fn acquire(&self) -> Result<PooledConnection> {
        self.pool.acquire()
    }

    /// Record one statement execution for latency/eviction bookkeeping.
    pub fn record_statement(&self, sql: &str, latency: Duration) {
        self.statement_stats.record(sql, latency);
    }

    /// Run `fetch`, optionally serving and storing its serialized result in
    /// the TTL+LRU cache. `params_key` disambiguates executions of the same
    /// SQL with different bind values.
    pub fn execute_cached<T, F>(
        &self,
        sql: &str,
        params_key: &str,
        cacheable: bool,
        fetch: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let key = cache_key(sql, params_key);

        if cacheable {
            if let Some(cached) = self.result_cache.get(&key) {
                if let Ok(value) = serde_json::from_str(&cached) {
                    return Ok(value);
                }
                // Unreadable entry; fall through and overwrite it.
            }
        }

        let started = Instant::now();
        let value = fetch()?;
        self.record_statement(sql, started.elapsed());

        if cacheable {
            match serde_json::to_string(&value) {
                Ok(serialized) => self.result_cache.put(key, serialized),
                Err(e) => debug!(error = %e, "result not cacheable, skipping"),
            }
        }

        Ok(value)
    }

    /// Report the current in-memory stream-buffer footprint.
    pub fn report_buffer_bytes(&self, bytes: u64) {
        self.external_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Recompute the memory estimate and classify pressure, running forced
    /// cleanup when critical. Called by the monitoring timer.
    pub fn sample_memory(&self) -> PressureLevel {
        let cache = self.result_cache.stats();
        let used = self.external_bytes.load(Ordering::Relaxed)
            + cache.bytes as u64
            + self.pool.open_count() as u64 * CONNECTION_PAGE_CACHE_BYTES;
        self.memory.set_usage(used);

        let level = self.memory.sample();
        if level == PressureLevel::Critical {
            warn!(used_bytes = used, "memory pressure critical, forcing cleanup");
            self.forced_cleanup();
        }
        level
    }

    /// Routine cleanup cycle: expire stale cache entries and close idle
    /// connections past the idle timeout. Runs on a fixed interval
    /// independent of pressure.
    pub fn routine_cleanup(&self) {
        let expired = self.result_cache.evict_expired();
        let closed = self.pool.close_idle(
            Duration::from_millis(self.config.idle_connection_timeout_ms),
            0,
        );
        if expired > 0 || closed > 0 {
            debug!(expired, closed, "routine resource cleanup");
        }
    }

    /// Forced cleanup under pressure: drop the result cache and close idle
    /// connections down to the 30%-of-pool floor.
    pub fn forced_cleanup(&self) {
        self.result_cache.clear();
        self.pool.close_idle(Duration::ZERO, self.pool.idle_floor());
    }

    pub fn result_cache(&self) -> &ResultCache {
        &self.result_cache
    }

    pub fn metrics(&self) -> ResourceMetrics {
        let cache = self.result_cache.stats();
        let used = self.memory.used_bytes();
        ResourceMetrics {
            pool_open: self.pool.open_count(),
            pool_idle: self.pool.idle_count(),
            pool_utilization: self.pool.utilization(),
            cache,
            avg_statement_latency_ms: self.statement_stats.avg_latency_ms(),
            memory_used_bytes: used,
            pressure: self.memory.classify(used),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> Arc<ResourceManager> {
        ResourceManager::open_in_memory(EngineConfig {
            pool_size: 2,
            connection_timeout_ms: 200,
            result_cache_ttl_ms: 40,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_execute_cached_serves_from_cache() {
        let rm = manager();
        let calls = AtomicUsize::new(0);

        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![1, 2, 3])
        };
        let first: Vec<i32> = rm.execute_cached("SELECT x", "p1", true, fetch).unwrap();
        assert_eq!(first, vec![1, 2, 3]);

        let second: Vec<i32> = rm
            .execute_cached("SELECT x", "p1", true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![9])
            })
            .unwrap();
        // Served from cache: second fetch never ran.
        assert_eq!(second, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_execute_cached_reexecutes_after_expiry() {
        let rm = manager();
        let first: i32 = rm.execute_cached("SELECT y", "", true, || Ok(1)).unwrap();
        assert_eq!(first, 1);

        std::thread::sleep(Duration::from_millis(60));
        let second: i32 = rm.execute_cached("SELECT y", "", true, || Ok(2)).unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn test_uncacheable_always_executes() {
        let rm = manager();
        let a: i32 = rm.execute_cached("SELECT z", "", false, || Ok(1)).unwrap();
        let b: i32 = rm.execute_cached("SELECT z", "", false, || Ok(2)).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_params_disambiguate_cache_entries() {
        let rm = manager();
        let a: i32 = rm.execute_cached("SELECT n", "1", true, || Ok(1)).unwrap();
        let b: i32 = rm.execute_cached("SELECT n", "2", true, || Ok(2)).unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_forced_cleanup_clears_cache() {
        let rm = manager();
        let _: i32 = rm.execute_cached("SELECT c", "", true, || Ok(7)).unwrap();
        assert_eq!(rm.result_cache().stats().entries, 1);

        rm.forced_cleanup();
        assert_eq!(rm.result_cache().stats().entries, 0);
    }
}
