mod anomalies;
mod cache;
mod percentiles;

pub use anomalies::{Anomaly, AnomalyKind};
pub use percentiles::PercentileSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use tracevault_store::{fmt_ts, Store};
use tracevault_types::{
    Error, EventFilter, EventRecord, EventType, Result, SessionFilter, SessionRecord,
    SessionStatus, SortOrder,
};

use cache::TtlCache;
use percentiles::compute_percentiles;

const TTL_REALTIME: Duration = Duration::from_secs(30);
const TTL_QUERY: Duration = Duration::from_secs(60);
const TTL_HOURLY: Duration = Duration::from_secs(300);
const TTL_DAILY: Duration = Duration::from_secs(1_800);

/// Upper bound on sessions sampled for the anomaly baseline.
const BASELINE_SAMPLE_LIMIT: usize = 1_000;

/// A session row plus derived per-session response timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub agent_type: String,
    pub mode: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub event_count: i64,
    pub stream_event_count: i64,
    pub error_count: i64,
    /// Mean gap between consecutive events, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub window: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_sessions: usize,
    pub total_events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
    /// Error events over all events in the window.
    pub error_rate: f64,
    pub duration_percentiles: PercentileSet,
    pub sessions_by_agent: Vec<(String, i64)>,
    pub sessions_by_mode: Vec<(String, i64)>,
}

/// One aligned hour/day aggregation bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBucket {
    pub bucket_start: DateTime<Utc>,
    pub total_sessions: usize,
    pub total_events: usize,
    pub unique_agents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealTimeMetrics {
    pub active_sessions: usize,
    pub events_last_minute: usize,
    pub error_rate_last_minute: f64,
    /// Top error types seen in the last 5 minutes, most frequent first.
    pub top_error_types: Vec<(String, i64)>,
    pub active_agents: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

/// Analytical queries over the telemetry store, cached with per-query TTLs.
pub struct AnalyticsEngine {
    store: Store,
    cache: TtlCache,
    stddev_threshold: f64,
}

impl AnalyticsEngine {
    pub fn new(store: Store) -> Self {
        let stddev_threshold = store.resources().config().anomaly_stddev_threshold;
        Self {
            store,
            cache: TtlCache::new(),
            stddev_threshold,
        }
    }

    /// Serve from the analytics cache or compute and store.
    fn cached<T, F>(&self, key: String, ttl: Duration, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        if let Some(hit) = self.cache.get(&key) {
            if let Ok(value) = serde_json::from_str(&hit) {
                return Ok(value);
            }
        }
        let value = compute()?;
        if let Ok(serialized) = serde_json::to_string(&value) {
            self.cache.put(key, serialized, ttl);
        }
        Ok(value)
    }

    /// Background refresh hook: drops expired entries so the next caller
    /// recomputes them.
    pub fn refresh_cache(&self) -> usize {
        self.cache.evict_expired()
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    pub fn session_summaries(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>> {
        let key = format!("summaries:{}", serde_json::to_string(filter)?);
        self.cached(key, TTL_QUERY, || {
            let sessions = self.store.query_sessions(filter)?;
            if sessions.is_empty() {
                return Ok(Vec::new());
            }

            let ids: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
            let events = self.store.query_events(&EventFilter {
                session_ids: ids,
                order: SortOrder::Asc,
                ..Default::default()
            })?;

            let mut timestamps: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
            for event in &events {
                timestamps
                    .entry(event.session_id.as_str())
                    .or_default()
                    .push(event.timestamp);
            }

            Ok(sessions
                .iter()
                .map(|s| {
                    let avg_gap = timestamps.get(s.id.as_str()).and_then(|ts| {
                        if ts.len() < 2 {
                            return None;
                        }
                        let total: i64 = ts
                            .windows(2)
                            .map(|w| (w[1] - w[0]).num_milliseconds())
                            .sum();
                        Some(total as f64 / (ts.len() - 1) as f64)
                    });
                    SessionSummary {
                        id: s.id.clone(),
                        agent_type: s.agent_type.clone(),
                        mode: s.mode.clone(),
                        status: s.status,
                        start_time: s.start_time,
                        end_time: s.end_time,
                        duration_ms: s.duration_ms,
                        event_count: s.event_count,
                        stream_event_count: s.stream_event_count,
                        error_count: s.error_count,
                        avg_response_time_ms: avg_gap,
                    }
                })
                .collect())
        })
    }

    pub fn performance_metrics(
        &self,
        window: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PerformanceMetrics> {
        let key = format!("perf:{}:{}:{}", window, fmt_ts(from), fmt_ts(to));
        let window = window.to_string();
        self.cached(key, TTL_QUERY, || {
            let sessions = self.sessions_in_range(from, to)?;
            let events = self.events_in_range(from, to)?;

            let durations: Vec<f64> = sessions
                .iter()
                .filter_map(|s| s.duration_ms.map(|d| d as f64))
                .collect();
            let avg_duration_ms = if durations.is_empty() {
                None
            } else {
                Some(durations.iter().sum::<f64>() / durations.len() as f64)
            };

            let error_events = events
                .iter()
                .filter(|e| e.event_type == EventType::Error)
                .count();
            let error_rate = if events.is_empty() {
                0.0
            } else {
                error_events as f64 / events.len() as f64
            };

            let mut sorted = durations;
            Ok(PerformanceMetrics {
                window,
                from,
                to,
                total_sessions: sessions.len(),
                total_events: events.len(),
                avg_duration_ms,
                error_rate,
                duration_percentiles: compute_percentiles(&mut sorted),
                sessions_by_agent: count_by(&sessions, |s| s.agent_type.clone()),
                sessions_by_mode: count_by(&sessions, |s| s.mode.clone()),
            })
        })
    }

    pub fn hourly_aggregations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeBucket>> {
        let key = format!("hourly:{}:{}", fmt_ts(from), fmt_ts(to));
        self.cached(key, TTL_HOURLY, || self.aggregate(from, to, 3_600))
    }

    pub fn daily_aggregations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeBucket>> {
        let key = format!("daily:{}:{}", fmt_ts(from), fmt_ts(to));
        self.cached(key, TTL_DAILY, || self.aggregate(from, to, 86_400))
    }

    fn aggregate(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Result<Vec<TimeBucket>> {
        let sessions = self.sessions_in_range(from, to)?;
        let events = self.events_in_range(from, to)?;

        let align = |ts: DateTime<Utc>| ts.timestamp() - ts.timestamp().rem_euclid(bucket_secs);

        let mut session_buckets: BTreeMap<i64, Vec<&SessionRecord>> = BTreeMap::new();
        for session in &sessions {
            session_buckets
                .entry(align(session.start_time))
                .or_default()
                .push(session);
        }
        let mut event_buckets: BTreeMap<i64, Vec<&EventRecord>> = BTreeMap::new();
        for event in &events {
            event_buckets
                .entry(align(event.timestamp))
                .or_default()
                .push(event);
        }

        let mut keys: BTreeSet<i64> = session_buckets.keys().copied().collect();
        keys.extend(event_buckets.keys().copied());

        let mut buckets = Vec::new();
        for key in &keys {
            let bucket_sessions = session_buckets.get(key).map(Vec::as_slice).unwrap_or(&[]);
            let bucket_events = event_buckets.get(key).map(Vec::as_slice).unwrap_or(&[]);

            let agents: HashSet<&str> = bucket_sessions
                .iter()
                .map(|s| s.agent_type.as_str())
                .collect();
            let durations: Vec<f64> = bucket_sessions
                .iter()
                .filter_map(|s| s.duration_ms.map(|d| d as f64))
                .collect();
            let errors = bucket_events
                .iter()
                .filter(|e| e.event_type == EventType::Error)
                .count();

            let by_agent = count_by(bucket_sessions, |s| s.agent_type.clone());
            let by_mode = count_by(bucket_sessions, |s| s.mode.clone());

            buckets.push(TimeBucket {
                bucket_start: DateTime::from_timestamp(*key, 0)
                    .ok_or_else(|| Error::InvalidOperation("bucket out of range".to_string()))?,
                total_sessions: bucket_sessions.len(),
                total_events: bucket_events.len(),
                unique_agents: agents.len(),
                avg_duration_ms: if durations.is_empty() {
                    None
                } else {
                    Some(durations.iter().sum::<f64>() / durations.len() as f64)
                },
                error_rate: if bucket_events.is_empty() {
                    0.0
                } else {
                    errors as f64 / bucket_events.len() as f64
                },
                top_agent: by_agent.first().map(|(name, _)| name.clone()),
                top_mode: by_mode.first().map(|(name, _)| name.clone()),
            });
        }
        Ok(buckets)
    }

    /// Live dashboard figures over the last one/five minutes.
    pub fn real_time_metrics(&self) -> Result<RealTimeMetrics> {
        self.cached("realtime".to_string(), TTL_REALTIME, || {
            let now = Utc::now();
            let one_minute_ago = now - ChronoDuration::minutes(1);
            let five_minutes_ago = now - ChronoDuration::minutes(5);

            // Active: started in the last 5 minutes, and either still marked
            // active or started within the last minute without ending.
            let recent = self.sessions_in_range(five_minutes_ago, now)?;
            let active: Vec<&SessionRecord> = recent
                .iter()
                .filter(|s| {
                    s.status == SessionStatus::Active
                        || (s.start_time >= one_minute_ago && s.end_time.is_none())
                })
                .collect();

            let recent_events = self.events_in_range(one_minute_ago, now)?;
            let recent_errors = recent_events
                .iter()
                .filter(|e| e.event_type == EventType::Error)
                .count();

            let errors = self.store.query_errors(Some(five_minutes_ago), None, None)?;
            let mut error_types: HashMap<String, i64> = HashMap::new();
            for error in &errors {
                *error_types.entry(error.error_type.clone()).or_default() += 1;
            }
            let mut top_error_types: Vec<(String, i64)> = error_types.into_iter().collect();
            top_error_types.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            top_error_types.truncate(5);

            let mut active_agents: Vec<String> = active
                .iter()
                .map(|s| s.agent_type.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            active_agents.sort();

            Ok(RealTimeMetrics {
                active_sessions: active.len(),
                events_last_minute: recent_events.len(),
                error_rate_last_minute: if recent_events.is_empty() {
                    0.0
                } else {
                    recent_errors as f64 / recent_events.len() as f64
                },
                top_error_types,
                active_agents,
                computed_at: now,
            })
        })
    }

    /// Percentiles of a sampled metric over the range. Supported metrics:
    /// `session_duration` (ms) and `events_per_session`.
    pub fn calculate_percentiles(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PercentileSet> {
        let key = format!("pctl:{}:{}:{}", metric, fmt_ts(from), fmt_ts(to));
        let metric = metric.to_string();
        self.cached(key, TTL_QUERY, || {
            let sessions = self.sessions_in_range(from, to)?;
            let mut values: Vec<f64> = match metric.as_str() {
                "session_duration" => sessions
                    .iter()
                    .filter_map(|s| s.duration_ms.map(|d| d as f64))
                    .collect(),
                "events_per_session" => sessions.iter().map(|s| s.event_count as f64).collect(),
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "unknown percentile metric: {}",
                        other
                    )))
                }
            };
            Ok(compute_percentiles(&mut values))
        })
    }

    /// Run all four detectors over the range and rank the results by
    /// severity, then recency.
    pub fn detect_anomalies(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>> {
        let key = format!("anomalies:{}:{}", fmt_ts(from), fmt_ts(to));
        self.cached(key, TTL_QUERY, || {
            let sessions = self.sessions_in_range(from, to)?;
            let events = self.events_in_range(from, to)?;

            // Historical baseline: completed sessions before the range.
            let history = self.store.query_sessions(&SessionFilter {
                to: Some(from),
                order: SortOrder::Desc,
                limit: Some(BASELINE_SAMPLE_LIMIT),
                ..Default::default()
            })?;
            let baseline: Vec<f64> = history
                .iter()
                .filter_map(|s| s.duration_ms.map(|d| d as f64))
                .collect();

            let mut anomalies =
                anomalies::detect_duration_spikes(&sessions, &baseline, self.stddev_threshold);
            anomalies.extend(anomalies::detect_error_spikes(&events, from, to));
            anomalies.extend(anomalies::detect_session_drops(&sessions, from, to));
            anomalies.extend(anomalies::detect_unusual_patterns(&sessions, to));

            Ok(anomalies::rank(anomalies))
        })
    }

    fn sessions_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>> {
        self.store.query_sessions(&SessionFilter {
            from: Some(from),
            to: Some(to),
            order: SortOrder::Asc,
            ..Default::default()
        })
    }

    fn events_in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        self.store.query_events(&EventFilter {
            from: Some(from),
            to: Some(to),
            order: SortOrder::Asc,
            ..Default::default()
        })
    }
}

/// Count sessions grouped by a key, most frequent first (name breaks ties).
fn count_by<F>(sessions: &[impl std::borrow::Borrow<SessionRecord>], key: F) -> Vec<(String, i64)>
where
    F: Fn(&SessionRecord) -> String,
{
    let mut counts: HashMap<String, i64> = HashMap::new();
    for session in sessions {
        *counts.entry(key(session.borrow())).or_default() += 1;
    }
    let mut counts: Vec<(String, i64)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tracevault_types::{EngineConfig, EventRecord};

    fn seeded_store() -> Store {
        Store::open_in_memory(EngineConfig::default()).unwrap()
    }

    fn put_session(
        store: &Store,
        id: &str,
        agent: &str,
        mode: &str,
        hour: u32,
        minute: u32,
    ) -> SessionRecord {
        let record = SessionRecord {
            id: id.to_string(),
            agent_type: agent.to_string(),
            mode: mode.to_string(),
            status: SessionStatus::Completed,
            start_time: Utc.with_ymd_and_hms(2026, 1, 1, hour, minute, 0).unwrap(),
            end_time: None,
            duration_ms: None,
            event_count: 0,
            stream_event_count: 0,
            error_count: 0,
            sandbox_id: None,
            repo_url: None,
            metadata: None,
            version: 1,
            schema_version: "1.0".to_string(),
        };
        store.upsert_session(&record).unwrap();
        record
    }

    fn put_events(store: &Store, session_id: &str, hour: u32, minute: u32, specs: &[(EventType, u32)]) {
        let events: Vec<EventRecord> = specs
            .iter()
            .map(|(event_type, secs)| {
                let ts = Utc
                    .with_ymd_and_hms(2026, 1, 1, hour, minute, *secs)
                    .unwrap();
                EventRecord {
                    id: 0,
                    session_id: session_id.to_string(),
                    event_type: *event_type,
                    agent_type: "claude".to_string(),
                    mode: "code".to_string(),
                    prompt: String::new(),
                    stream_data: None,
                    sandbox_id: None,
                    repo_url: None,
                    metadata: None,
                    timestamp: ts,
                    created_at: ts,
                }
            })
            .collect();
        store.insert_event_batch(&events).unwrap();
    }

    #[test]
    fn test_session_summaries_average_gap() {
        let store = seeded_store();
        put_session(&store, "s1", "claude", "code", 10, 0);
        // Events at 0s, 2s, 4s: average gap 2000ms.
        put_events(
            &store,
            "s1",
            10,
            0,
            &[
                (EventType::Start, 0),
                (EventType::Stream, 2),
                (EventType::End, 4),
            ],
        );

        let engine = AnalyticsEngine::new(store);
        let summaries = engine
            .session_summaries(&SessionFilter::default())
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].avg_response_time_ms, Some(2_000.0));
        assert_eq!(summaries[0].event_count, 3);
    }

    #[test]
    fn test_performance_metrics_error_rate() {
        let store = seeded_store();
        put_session(&store, "s1", "claude", "code", 10, 0);
        put_events(
            &store,
            "s1",
            10,
            0,
            &[
                (EventType::Start, 0),
                (EventType::Stream, 1),
                (EventType::Stream, 2),
                (EventType::Error, 3),
            ],
        );

        let engine = AnalyticsEngine::new(store);
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap();
        let metrics = engine.performance_metrics("test", from, to).unwrap();

        assert_eq!(metrics.total_sessions, 1);
        assert_eq!(metrics.total_events, 4);
        assert!((metrics.error_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(metrics.sessions_by_agent, vec![("claude".to_string(), 1)]);
    }

    #[test]
    fn test_hourly_buckets_align() {
        let store = seeded_store();
        put_session(&store, "a", "claude", "code", 10, 5);
        put_session(&store, "b", "claude", "plan", 10, 55);
        put_session(&store, "c", "codex", "code", 11, 5);

        let engine = AnalyticsEngine::new(store);
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let buckets = engine.hourly_aggregations(from, to).unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].total_sessions, 2);
        assert_eq!(buckets[0].unique_agents, 1);
        assert_eq!(buckets[0].top_agent.as_deref(), Some("claude"));
        assert_eq!(buckets[1].total_sessions, 1);
        assert_eq!(
            buckets[1].bucket_start,
            Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_calculate_percentiles_unknown_metric() {
        let engine = AnalyticsEngine::new(seeded_store());
        let now = Utc::now();
        let err = engine
            .calculate_percentiles("bogus", now - ChronoDuration::hours(1), now)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_results_cached_until_invalidated() {
        let store = seeded_store();
        put_session(&store, "s1", "claude", "code", 10, 0);

        let engine = AnalyticsEngine::new(store.clone());
        let filter = SessionFilter::default();
        assert_eq!(engine.session_summaries(&filter).unwrap().len(), 1);

        put_session(&store, "s2", "claude", "code", 10, 1);
        // Cache still serves the old answer.
        assert_eq!(engine.session_summaries(&filter).unwrap().len(), 1);

        engine.invalidate_cache();
        assert_eq!(engine.session_summaries(&filter).unwrap().len(), 2);
    }
}
