use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracevault_types::EngineConfig;

/// Cache key for a (sql, params) pair.
pub fn cache_key(sql: &str, params_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hasher.update([0u8]);
    hasher.update(params_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    value: String,
    created_at: Instant,
    last_used: Instant,
}

/// Aggregate cache counters for the performance monitor.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 1.0;
        }
        self.hits as f64 / total as f64
    }
}

/// TTL + LRU cache of serialized query results.
///
/// Entries past their TTL are unreachable: a get after expiry removes the
/// entry and reports a miss, so the caller always re-executes the query.
/// Values above the size threshold are never admitted.
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    max_value_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: config.result_cache_ttl(),
            max_entries: config.result_cache_max_entries,
            max_value_bytes: config.result_cache_max_value_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get_mut(key) {
            Some(entry) if entry.created_at.elapsed() <= self.ttl => {
                entry.last_used = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, value: String) {
        if value.len() > self.max_value_bytes {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // Evict the least-recently-used entry.
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
            }
        }

        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_used: now,
            },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.created_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = match self.entries.lock() {
            Ok(map) => (map.len(), map.values().map(|e| e.value.len()).sum()),
            Err(_) => (0, 0),
        };
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes,
        }
    }
}

/// Usage record for one prepared statement, keyed by SQL-text hash.
#[derive(Debug, Clone)]
pub struct StatementUsage {
    pub sql: String,
    pub executions: u64,
    pub avg_latency_ms: f64,
    last_used: Instant,
}

/// Execution-count and rolling-latency bookkeeping for cached statements.
///
/// The statements themselves live in rusqlite's per-connection prepared
/// cache; this table is the cross-connection view the performance monitor
/// reads. LRU-capped to the statement cache size.
pub struct StatementStats {
    entries: Mutex<HashMap<String, StatementUsage>>,
    capacity: usize,
}

impl StatementStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn record(&self, sql: &str, latency: Duration) {
        let key = cache_key(sql, "");
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };

        if let Some(usage) = entries.get_mut(&key) {
            let ms = latency.as_secs_f64() * 1_000.0;
            // Rolling average over all executions of this statement.
            usage.avg_latency_ms = (usage.avg_latency_ms * usage.executions as f64 + ms)
                / (usage.executions + 1) as f64;
            usage.executions += 1;
            usage.last_used = Instant::now();
            return;
        }

        if entries.len() >= self.capacity {
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, u)| u.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
            }
        }

        entries.insert(
            key,
            StatementUsage {
                sql: sql.to_string(),
                executions: 1,
                avg_latency_ms: latency.as_secs_f64() * 1_000.0,
                last_used: Instant::now(),
            },
        );
    }

    pub fn snapshot(&self) -> Vec<StatementUsage> {
        self.entries
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Mean latency across all tracked statements, for monitoring.
    pub fn avg_latency_ms(&self) -> f64 {
        let Ok(entries) = self.entries.lock() else {
            return 0.0;
        };
        if entries.is_empty() {
            return 0.0;
        }
        let total_execs: u64 = entries.values().map(|u| u.executions).sum();
        if total_execs == 0 {
            return 0.0;
        }
        entries
            .values()
            .map(|u| u.avg_latency_ms * u.executions as f64)
            .sum::<f64>()
            / total_execs as f64
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
