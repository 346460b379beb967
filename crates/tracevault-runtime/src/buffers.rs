use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use tracevault_store::Store;
use tracevault_types::{EventRecord, Result};

/// Bookkeeping entries outlive their buffer by at most this long.
const BOOKKEEPING_MAX_AGE: Duration = Duration::from_secs(300);

/// Rough per-event overhead added to payload bytes when estimating the
/// in-memory footprint reported to the resource manager.
const EVENT_OVERHEAD_BYTES: usize = 256;

struct Buffer {
    events: Vec<EventRecord>,
    bytes: usize,
    created: Instant,
    updated: Instant,
}

impl Buffer {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            events: Vec::new(),
            bytes: 0,
            created: now,
            updated: now,
        }
    }

    fn push(&mut self, event: EventRecord) {
        self.bytes += EVENT_OVERHEAD_BYTES
            + event.prompt.len()
            + event.stream_data.as_deref().map_or(0, str::len)
            + event.metadata.as_deref().map_or(0, str::len);
        self.events.push(event);
        self.updated = Instant::now();
    }
}

/// Timestamps retained after a buffer flushes, for staleness accounting.
struct Bookkeeping {
    last_active: Instant,
}

/// In-memory stream buffers keyed by (session_id, agent_type).
///
/// Events accumulate in arrival order and flush to the store as one durable
/// buffer row followed by a transactional batch insert. Flushing happens on
/// three triggers: the item threshold, a terminal event for the session,
/// and the periodic staleness sweep.
pub struct StreamBuffers {
    store: Store,
    inner: Mutex<Inner>,
    flush_threshold: usize,
    flush_interval: Duration,
    max_buffers: usize,
}

struct Inner {
    buffers: HashMap<(String, String), Buffer>,
    bookkeeping: HashMap<(String, String), Bookkeeping>,
}

impl StreamBuffers {
    pub fn new(store: Store) -> Self {
        let config = store.resources().config();
        let flush_threshold = config.buffer_flush_threshold;
        let flush_interval = config.buffer_flush_interval();
        let max_buffers = config.max_concurrent_buffers;
        Self {
            store,
            inner: Mutex::new(Inner {
                buffers: HashMap::new(),
                bookkeeping: HashMap::new(),
            }),
            flush_threshold,
            flush_interval,
            max_buffers,
        }
    }

    /// Append a stream event to its (session, agent) buffer, creating the
    /// buffer lazily. Auto-flushes at the item threshold and force-flushes
    /// the oldest buffers when the buffer-count ceiling is exceeded.
    /// Returns the number of events persisted as a side effect.
    pub fn append(&self, event: EventRecord) -> Result<usize> {
        let key = (event.session_id.clone(), event.agent_type.clone());

        let (to_flush, overflow) = {
            let mut inner = self.lock();
            inner.buffers.entry(key.clone()).or_insert_with(Buffer::new).push(event);
            inner
                .bookkeeping
                .insert(key.clone(), Bookkeeping { last_active: Instant::now() });

            let full = inner.buffers[&key].events.len() >= self.flush_threshold;
            let to_flush = if full {
                inner.buffers.remove(&key).map(|b| (key.clone(), b.events))
            } else {
                None
            };

            let mut overflow = Vec::new();
            if inner.buffers.len() > self.max_buffers {
                let excess = inner.buffers.len() - self.max_buffers;
                let mut keys: Vec<_> = inner
                    .buffers
                    .iter()
                    .map(|(k, b)| (b.created, k.clone()))
                    .collect();
                keys.sort_by_key(|(created, _)| *created);
                for (_, old_key) in keys.into_iter().take(excess) {
                    if let Some(buffer) = inner.buffers.remove(&old_key) {
                        overflow.push((old_key, buffer.events));
                    }
                }
            }

            (to_flush, overflow)
        };

        self.report_memory();

        let mut persisted = 0;
        if let Some((key, events)) = to_flush {
            persisted += self.persist(&key, events)?;
        }
        for (key, events) in overflow {
            debug!(session_id = %key.0, "buffer ceiling exceeded, force-flushing oldest");
            persisted += self.persist(&key, events)?;
        }
        Ok(persisted)
    }

    /// Force-flush every buffer belonging to a session. Called before a
    /// terminal event is persisted so it observes all prior stream data.
    pub fn flush_session(&self, session_id: &str) -> Result<usize> {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            let keys: Vec<_> = inner
                .buffers
                .keys()
                .filter(|(sid, _)| sid == session_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.buffers.remove(&k).map(|b| (k, b.events)))
                .collect()
        };
        self.report_memory();

        let mut persisted = 0;
        for (key, events) in drained {
            persisted += self.persist(&key, events)?;
        }
        Ok(persisted)
    }

    /// Drain every live buffer, oldest first. Used at shutdown.
    pub fn flush_all(&self) -> Result<usize> {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            let mut keys: Vec<_> = inner
                .buffers
                .iter()
                .map(|(k, b)| (b.created, k.clone()))
                .collect();
            keys.sort_by_key(|(created, _)| *created);
            keys.into_iter()
                .filter_map(|(_, k)| inner.buffers.remove(&k).map(|b| (k, b.events)))
                .collect()
        };
        self.report_memory();

        let mut persisted = 0;
        for (key, events) in drained {
            persisted += self.persist(&key, events)?;
        }
        Ok(persisted)
    }

    /// Periodic sweep: flush buffers idle for 2x the flush interval and
    /// evict bookkeeping entries with no live buffer past the age cap.
    pub fn flush_stale(&self) -> usize {
        let stale_after = self.flush_interval * 2;
        let drained: Vec<_> = {
            let mut inner = self.lock();
            let now = Instant::now();
            let keys: Vec<_> = inner
                .buffers
                .iter()
                .filter(|(_, b)| now.duration_since(b.updated) >= stale_after)
                .map(|(k, _)| k.clone())
                .collect();
            let drained: Vec<_> = keys
                .into_iter()
                .filter_map(|k| inner.buffers.remove(&k).map(|b| (k, b.events)))
                .collect();

            let live: Vec<_> = inner.buffers.keys().cloned().collect();
            inner.bookkeeping.retain(|key, entry| {
                live.contains(key) || now.duration_since(entry.last_active) < BOOKKEEPING_MAX_AGE
            });

            drained
        };
        self.report_memory();

        let mut persisted = 0;
        for (key, events) in drained {
            match self.persist(&key, events) {
                Ok(n) => persisted += n,
                Err(e) => {
                    warn!(session_id = %key.0, error = %e, "stale buffer flush failed");
                }
            }
        }
        persisted
    }

    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn pending_events(&self, session_id: &str, agent_type: &str) -> usize {
        self.lock()
            .buffers
            .get(&(session_id.to_string(), agent_type.to_string()))
            .map_or(0, |b| b.events.len())
    }

    /// Durably stage the events as a buffer row, then flush it into the
    /// events table. The store marks the buffer failed on a partial flush,
    /// so this either persists everything or nothing.
    fn persist(&self, key: &(String, String), events: Vec<EventRecord>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let payload = serde_json::to_string(&events)?;
        self.store.save_buffer(&key.0, &key.1, &payload)?;
        self.store.flush_buffer(&key.0)
    }

    fn report_memory(&self) {
        let total: usize = {
            let inner = self.lock();
            inner.buffers.values().map(|b| b.bytes).sum()
        };
        self.store.resources().report_buffer_bytes(total as u64);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracevault_types::{
        EngineConfig, EventType, SessionRecord, SessionStatus, METADATA_SCHEMA_VERSION,
    };

    fn store(config: EngineConfig) -> Store {
        let store = Store::open_in_memory(config).unwrap();
        store
            .upsert_session(&SessionRecord {
                id: "s1".to_string(),
                agent_type: "claude".to_string(),
                mode: "interactive".to_string(),
                status: SessionStatus::Active,
                start_time: Utc::now(),
                end_time: None,
                duration_ms: None,
                event_count: 0,
                stream_event_count: 0,
                error_count: 0,
                sandbox_id: None,
                repo_url: None,
                metadata: None,
                version: 1,
                schema_version: METADATA_SCHEMA_VERSION.to_string(),
            })
            .unwrap();
        store
    }

    fn stream_event(session_id: &str, n: usize) -> EventRecord {
        EventRecord {
            id: 0,
            session_id: session_id.to_string(),
            event_type: EventType::Stream,
            agent_type: "claude".to_string(),
            mode: "interactive".to_string(),
            prompt: "p".to_string(),
            stream_data: Some(format!("chunk-{}", n)),
            sandbox_id: None,
            repo_url: None,
            metadata: None,
            timestamp: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_buffer_accumulates_below_threshold() {
        let store = store(EngineConfig::default());
        let buffers = StreamBuffers::new(store.clone());

        for n in 0..10 {
            assert_eq!(buffers.append(stream_event("s1", n)).unwrap(), 0);
        }
        assert_eq!(buffers.pending_events("s1", "claude"), 10);
        assert_eq!(store.get_session("s1").unwrap().unwrap().event_count, 0);
    }

    #[test]
    fn test_auto_flush_at_threshold() {
        let store = store(EngineConfig::default());
        let buffers = StreamBuffers::new(store.clone());

        for n in 0..49 {
            assert_eq!(buffers.append(stream_event("s1", n)).unwrap(), 0);
        }
        assert_eq!(buffers.append(stream_event("s1", 49)).unwrap(), 50);
        assert_eq!(buffers.pending_events("s1", "claude"), 0);

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.stream_event_count, 50);
    }

    #[test]
    fn test_flush_preserves_arrival_order() {
        let store = store(EngineConfig {
            buffer_flush_threshold: 5,
            ..Default::default()
        });
        let buffers = StreamBuffers::new(store.clone());
        for n in 0..5 {
            buffers.append(stream_event("s1", n)).unwrap();
        }

        let events = store
            .query_events(&tracevault_types::EventFilter::for_session("s1"))
            .unwrap();
        let chunks: Vec<_> = events
            .iter()
            .map(|e| e.stream_data.clone().unwrap())
            .collect();
        assert_eq!(chunks, vec!["chunk-0", "chunk-1", "chunk-2", "chunk-3", "chunk-4"]);
    }

    #[test]
    fn test_force_flush_session() {
        let store = store(EngineConfig::default());
        let buffers = StreamBuffers::new(store.clone());
        for n in 0..7 {
            buffers.append(stream_event("s1", n)).unwrap();
        }

        assert_eq!(buffers.flush_session("s1").unwrap(), 7);
        assert_eq!(buffers.buffer_count(), 0);
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.stream_event_count, 7);
    }

    #[test]
    fn test_stale_buffers_swept() {
        let store = store(EngineConfig {
            buffer_flush_interval_ms: 10,
            ..Default::default()
        });
        let buffers = StreamBuffers::new(store.clone());
        buffers.append(stream_event("s1", 0)).unwrap();

        // Not yet stale.
        assert_eq!(buffers.flush_stale(), 0);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(buffers.flush_stale(), 1);
        assert_eq!(buffers.buffer_count(), 0);
    }

    #[test]
    fn test_buffer_ceiling_force_flushes_oldest() {
        let store = store(EngineConfig {
            max_concurrent_buffers: 3,
            ..Default::default()
        });
        for id in ["s2", "s3", "s4"] {
            let mut session = store.get_session("s1").unwrap().unwrap();
            session.id = id.to_string();
            store.upsert_session(&session).unwrap();
        }
        let buffers = StreamBuffers::new(store.clone());

        for (n, id) in ["s1", "s2", "s3"].iter().enumerate() {
            buffers.append(stream_event(id, n)).unwrap();
        }
        assert_eq!(buffers.buffer_count(), 3);

        // Fourth distinct buffer exceeds the ceiling; the oldest flushes.
        let persisted = buffers.append(stream_event("s4", 3)).unwrap();
        assert_eq!(persisted, 1);
        assert_eq!(buffers.buffer_count(), 3);
        assert_eq!(buffers.pending_events("s1", "claude"), 0);
        assert_eq!(buffers.pending_events("s4", "claude"), 1);
    }
}
