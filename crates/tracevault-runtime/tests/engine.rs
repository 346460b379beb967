use chrono::{Duration, Utc};
use tempfile::TempDir;

use tracevault_engine::{AnomalyKind, ExportConfig, ExportFormat};
use tracevault_runtime::{BatchOutcome, TelemetryEngine};
use tracevault_types::{
    EndRequest, EngineConfig, ErrorRequest, EventFilter, EventRecord, EventType, ExportFilter,
    SessionFilter, SessionRecord, SessionStatus, StartRequest, StreamRequest,
    METADATA_SCHEMA_VERSION,
};

fn engine() -> TelemetryEngine {
    TelemetryEngine::new_in_memory(EngineConfig::default()).unwrap()
}

fn start_request(session_id: &str, agent_type: &str) -> StartRequest {
    StartRequest {
        session_id: session_id.to_string(),
        agent_type: agent_type.to_string(),
        mode: "interactive".to_string(),
        prompt: "fix the failing test".to_string(),
        sandbox_id: Some("sbx-1".to_string()),
        repo_url: None,
        metadata: None,
    }
}

fn stream_request(session_id: &str, chunk: &str) -> StreamRequest {
    StreamRequest {
        session_id: session_id.to_string(),
        agent_type: "claude".to_string(),
        mode: "interactive".to_string(),
        prompt: "fix the failing test".to_string(),
        stream_data: chunk.to_string(),
        metadata: None,
    }
}

fn end_request(session_id: &str) -> EndRequest {
    EndRequest {
        session_id: session_id.to_string(),
        agent_type: "claude".to_string(),
        mode: "interactive".to_string(),
        prompt: "fix the failing test".to_string(),
        metadata: None,
    }
}

#[test]
fn test_start_persists_session_and_event() {
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();

    let sessions = engine.query_sessions(&SessionFilter::default()).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Active);

    let events = engine.query_events(&EventFilter::for_session("s1")).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Start);
}

#[test]
fn test_stream_buffer_auto_flushes_at_threshold() {
    // Scenario: start, then exactly 50 stream chunks. The 50th append hits
    // the flush threshold and the whole buffer lands transactionally.
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();

    for n in 0..50 {
        engine
            .stream(stream_request("s1", &format!("chunk-{}", n)))
            .unwrap();
    }

    let session = engine
        .query_sessions(&SessionFilter::default())
        .unwrap()
        .remove(0);
    assert_eq!(session.stream_event_count, 50);
    // start + 50 streams
    assert_eq!(session.event_count, 51);
    assert_eq!(engine.events_dropped(), 0);
}

#[test]
fn test_end_flushes_pending_streams_first() {
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();
    for n in 0..7 {
        engine
            .stream(stream_request("s1", &format!("chunk-{}", n)))
            .unwrap();
    }

    engine.end(end_request("s1")).unwrap();

    let session = engine
        .query_sessions(&SessionFilter::default())
        .unwrap()
        .remove(0);
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.stream_event_count, 7);
    assert!(session.end_time.is_some());

    // The terminal event must come after every stream event.
    let events = engine.query_events(&EventFilter::for_session("s1")).unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::End);
}

#[test]
fn test_error_records_failure_and_error_row() {
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();
    engine
        .error(ErrorRequest {
            session_id: "s1".to_string(),
            agent_type: "claude".to_string(),
            mode: "interactive".to_string(),
            prompt: "fix the failing test".to_string(),
            error_message: "sandbox died".to_string(),
            metadata: None,
        })
        .unwrap();

    let session = engine
        .query_sessions(&SessionFilter::default())
        .unwrap()
        .remove(0);
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.error_count, 1);

    let errors = engine.store().query_errors(None, None, None).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "sandbox died");
}

#[test]
fn test_validation_failure_propagates_to_caller() {
    let engine = engine();
    let mut request = start_request("", "claude");
    request.session_id = String::new();

    let result = engine.start(request);
    assert!(matches!(
        result,
        Err(tracevault_types::Error::Validation(_))
    ));
    assert!(engine.query_sessions(&SessionFilter::default()).unwrap().is_empty());
}

#[test]
fn test_ingest_writes_audit_trail() {
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();
    engine.end(end_request("s1")).unwrap();

    let audit = engine.store().list_audit(None).unwrap();
    assert!(audit.len() >= 2);
    assert!(audit.iter().all(|a| a.table_name == "sessions"));
    assert!(audit.iter().any(|a| a.changed_fields.contains("status")));
}

#[test]
fn test_duration_spike_detected_against_baseline() {
    // Scenario: 50 historical sessions alternating 900/1100ms (mean 1000,
    // stddev 100), then one 9000ms session inside the query range. The
    // spike deviates by 80 standard deviations.
    let engine = engine();
    let store = engine.store();
    let now = Utc::now();
    let from = now - Duration::hours(1);

    for n in 0..50 {
        let duration = if n % 2 == 0 { 900 } else { 1100 };
        let start = from - Duration::hours(2) + Duration::minutes(n);
        store
            .upsert_session(&SessionRecord {
                id: format!("hist-{}", n),
                agent_type: "claude".to_string(),
                mode: "interactive".to_string(),
                status: SessionStatus::Completed,
                start_time: start,
                end_time: Some(start + Duration::milliseconds(duration)),
                duration_ms: Some(duration),
                event_count: 1,
                stream_event_count: 0,
                error_count: 0,
                sandbox_id: None,
                repo_url: None,
                metadata: None,
                version: 1,
                schema_version: METADATA_SCHEMA_VERSION.to_string(),
            })
            .unwrap();
    }
    store
        .upsert_session(&SessionRecord {
            id: "spike".to_string(),
            agent_type: "claude".to_string(),
            mode: "interactive".to_string(),
            status: SessionStatus::Completed,
            start_time: from + Duration::minutes(10),
            end_time: Some(from + Duration::minutes(10) + Duration::milliseconds(9000)),
            duration_ms: Some(9000),
            event_count: 1,
            stream_event_count: 0,
            error_count: 0,
            sandbox_id: None,
            repo_url: None,
            metadata: None,
            version: 1,
            schema_version: METADATA_SCHEMA_VERSION.to_string(),
        })
        .unwrap();

    let anomalies = engine.analytics().detect_anomalies(from, now).unwrap();
    let spikes: Vec<_> = anomalies
        .iter()
        .filter(|a| a.kind == AnomalyKind::DurationSpike)
        .collect();
    assert_eq!(spikes.len(), 1);
    assert_eq!(spikes[0].session_id.as_deref(), Some("spike"));
    let score = spikes[0].deviation_score.unwrap();
    assert!((score - 80.0).abs() < 0.5);
}

#[test]
fn test_percentiles_are_ordered() {
    let engine = engine();
    let store = engine.store();
    let now = Utc::now();

    for n in 0..20 {
        let start = now - Duration::minutes(30) + Duration::minutes(n);
        store
            .upsert_session(&SessionRecord {
                id: format!("s-{}", n),
                agent_type: "claude".to_string(),
                mode: "interactive".to_string(),
                status: SessionStatus::Completed,
                start_time: start,
                end_time: Some(start + Duration::milliseconds(100 * (n + 1))),
                duration_ms: Some(100 * (n + 1)),
                event_count: 1,
                stream_event_count: 0,
                error_count: 0,
                sandbox_id: None,
                repo_url: None,
                metadata: None,
                version: 1,
                schema_version: METADATA_SCHEMA_VERSION.to_string(),
            })
            .unwrap();
    }

    let p = engine
        .analytics()
        .calculate_percentiles("session_duration", now - Duration::hours(1), now)
        .unwrap();
    assert!(p.min <= p.p50);
    assert!(p.p50 <= p.p75);
    assert!(p.p75 <= p.p90);
    assert!(p.p90 <= p.p95);
    assert!(p.p95 <= p.p99);
    assert!(p.p99 <= p.max);
}

#[test]
fn test_export_honors_agent_filter_end_to_end() {
    // Scenario: 2 sessions (claude, codex), 3 events of which 2 belong to
    // the claude session; exporting with agent_types=["claude"] yields 1
    // session and 2 events.
    let dir = TempDir::new().unwrap();
    let engine = engine();
    engine.start(start_request("s-claude", "claude")).unwrap();

    let mut codex = start_request("s-codex", "codex");
    codex.agent_type = "codex".to_string();
    engine.start(codex).unwrap();

    engine.stream(stream_request("s-claude", "chunk")).unwrap();
    engine.end(end_request("s-claude")).unwrap();

    let filter = ExportFilter {
        agent_types: vec!["claude".to_string()],
        ..Default::default()
    };
    let metadata = engine
        .export(&filter, &ExportConfig::new(ExportFormat::Json, dir.path()))
        .unwrap();

    assert_eq!(metadata.record_counts["sessions"], 1);
    // start + stream + end for the claude session
    assert_eq!(metadata.record_counts["events"], 3);
    assert!(dir.path().join("export.json").exists());
    assert!(dir.path().join("export.metadata.json").exists());
}

#[test]
fn test_enqueued_event_hook_fires_once_with_success() {
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();

    let fired = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_fired = std::sync::Arc::clone(&fired);
    engine
        .enqueue_event(
            EventRecord {
                id: 0,
                session_id: "s1".to_string(),
                event_type: EventType::Stream,
                agent_type: "claude".to_string(),
                mode: "interactive".to_string(),
                prompt: "fix the failing test".to_string(),
                stream_data: Some("bulk chunk".to_string()),
                sandbox_id: None,
                repo_url: None,
                metadata: None,
                timestamp: Utc::now(),
                created_at: Utc::now(),
            },
            0,
            Some(Box::new(move |outcome| {
                hook_fired.lock().unwrap().push(outcome);
            })),
        )
        .unwrap();

    // Below the batch threshold: nothing persisted until an explicit or
    // timed flush. Shutdown forces the final flush.
    engine.shutdown();
    assert_eq!(fired.lock().unwrap().as_slice(), &[BatchOutcome::Persisted]);
}

#[test]
fn test_clear_all_data_is_idempotent() {
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();
    engine.stream(stream_request("s1", "chunk")).unwrap();
    engine.end(end_request("s1")).unwrap();

    engine.clear_all_data().unwrap();
    let stats = engine.statistics().unwrap();
    assert_eq!(stats.session_count, 0);
    assert_eq!(stats.event_count, 0);

    engine.clear_all_data().unwrap();
    let stats = engine.statistics().unwrap();
    assert_eq!(stats.session_count, 0);
}

#[test]
fn test_database_integrity_clean_after_ingest() {
    let engine = engine();
    engine.start(start_request("s1", "claude")).unwrap();
    engine.end(end_request("s1")).unwrap();

    let report = engine.validate_database_integrity().unwrap();
    assert!(report.is_clean());
}

#[test]
fn test_on_disk_engine_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("telemetry.db");

    {
        let engine = TelemetryEngine::new(&path, EngineConfig::default()).unwrap();
        engine.start(start_request("s1", "claude")).unwrap();
        engine.stream(stream_request("s1", "chunk")).unwrap();
        engine.end(end_request("s1")).unwrap();
        engine.shutdown();
    }

    let reopened = TelemetryEngine::new(&path, EngineConfig::default()).unwrap();
    let session = reopened
        .query_sessions(&SessionFilter::default())
        .unwrap()
        .remove(0);
    assert_eq!(session.id, "s1");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.stream_event_count, 1);
}
