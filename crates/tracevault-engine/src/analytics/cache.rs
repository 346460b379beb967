use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

/// Serialized-result cache with a per-entry TTL. Real-time queries use a
/// 30s TTL while daily aggregates live up to 30 minutes, so the TTL is
/// supplied at insertion rather than fixed per cache.
pub struct TtlCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if entry.created_at.elapsed() <= entry.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: String, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                Entry {
                    value,
                    created_at: Instant::now(),
                    ttl,
                },
            );
        }
    }

    /// Drop expired entries; called by the background refresh cycle.
    pub fn evict_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.created_at.elapsed() <= e.ttl);
        before - entries.len()
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_entry_ttl() {
        let cache = TtlCache::new();
        cache.put("fast".to_string(), "1".to_string(), Duration::from_millis(20));
        cache.put("slow".to_string(), "2".to_string(), Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("fast"), None);
        assert_eq!(cache.get("slow"), Some("2".to_string()));
    }

    #[test]
    fn test_evict_expired_counts() {
        let cache = TtlCache::new();
        cache.put("a".to_string(), "1".to_string(), Duration::from_millis(10));
        cache.put("b".to_string(), "2".to_string(), Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
