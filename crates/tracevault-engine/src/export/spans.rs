//! Trace-span rendering: each session becomes one span whose attributes
//! mirror the session row, with one child span-event per telemetry event.
//!
//! Ids follow the OTLP width conventions (16-byte trace id, 8-byte span
//! id, hex encoded) but are derived deterministically from the session id
//! so re-exports of the same data produce the same ids.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use tracevault_types::{EventRecord, SessionRecord};

pub(super) fn render(sessions: &[SessionRecord], events: &[EventRecord]) -> Value {
    let spans: Vec<Value> = sessions
        .iter()
        .map(|session| {
            let children: Vec<Value> = events
                .iter()
                .filter(|e| e.session_id == session.id)
                .map(span_event)
                .collect();
            span(session, children)
        })
        .collect();

    json!({
        "resource": {
            "service.name": "tracevault",
        },
        "spans": spans,
    })
}

fn span(session: &SessionRecord, events: Vec<Value>) -> Value {
    let digest = Sha256::digest(session.id.as_bytes());
    let trace_id = hex(&digest[..16]);
    let span_id = hex(&digest[16..24]);

    let start_ns = session.start_time.timestamp_nanos_opt().unwrap_or(0);
    let end_ns = session
        .end_time
        .and_then(|t| t.timestamp_nanos_opt())
        .unwrap_or(start_ns);

    let mut attributes = serde_json::Map::new();
    attributes.insert("session.id".to_string(), json!(session.id));
    attributes.insert("agent.type".to_string(), json!(session.agent_type));
    attributes.insert("session.mode".to_string(), json!(session.mode));
    attributes.insert("session.status".to_string(), json!(session.status));
    attributes.insert("event.count".to_string(), json!(session.event_count));
    attributes.insert(
        "stream.event.count".to_string(),
        json!(session.stream_event_count),
    );
    attributes.insert("error.count".to_string(), json!(session.error_count));
    if let Some(duration) = session.duration_ms {
        attributes.insert("duration.ms".to_string(), json!(duration));
    }
    if let Some(sandbox) = &session.sandbox_id {
        attributes.insert("sandbox.id".to_string(), json!(sandbox));
    }
    if let Some(repo) = &session.repo_url {
        attributes.insert("repo.url".to_string(), json!(repo));
    }

    json!({
        "traceId": trace_id,
        "spanId": span_id,
        "name": format!("session {}", session.id),
        "startTimeUnixNano": start_ns,
        "endTimeUnixNano": end_ns,
        "attributes": attributes,
        "events": events,
    })
}

fn span_event(event: &EventRecord) -> Value {
    let mut attributes = serde_json::Map::new();
    attributes.insert("event.type".to_string(), json!(event.event_type));
    attributes.insert("agent.type".to_string(), json!(event.agent_type));
    if !event.prompt.is_empty() {
        attributes.insert("prompt".to_string(), json!(event.prompt));
    }
    if let Some(data) = &event.stream_data {
        attributes.insert("stream.data".to_string(), json!(data));
    }

    json!({
        "name": event.event_type.as_str(),
        "timeUnixNano": event.timestamp.timestamp_nanos_opt().unwrap_or(0),
        "attributes": attributes,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracevault_types::{SessionStatus, METADATA_SCHEMA_VERSION};

    fn sample_session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            agent_type: "claude".to_string(),
            mode: "interactive".to_string(),
            status: SessionStatus::Completed,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            duration_ms: Some(1200),
            event_count: 3,
            stream_event_count: 2,
            error_count: 0,
            sandbox_id: None,
            repo_url: None,
            metadata: None,
            version: 1,
            schema_version: METADATA_SCHEMA_VERSION.to_string(),
        }
    }

    #[test]
    fn test_span_ids_deterministic() {
        let a = render(&[sample_session("s1")], &[]);
        let b = render(&[sample_session("s1")], &[]);
        assert_eq!(a["spans"][0]["traceId"], b["spans"][0]["traceId"]);
        assert_eq!(a["spans"][0]["spanId"], b["spans"][0]["spanId"]);
    }

    #[test]
    fn test_distinct_sessions_distinct_traces() {
        let doc = render(&[sample_session("s1"), sample_session("s2")], &[]);
        let spans = doc["spans"].as_array().unwrap();
        assert_ne!(spans[0]["traceId"], spans[1]["traceId"]);
    }

    #[test]
    fn test_open_session_end_defaults_to_start() {
        let mut session = sample_session("s1");
        session.end_time = None;
        let doc = render(&[session], &[]);
        let span = &doc["spans"][0];
        assert_eq!(span["startTimeUnixNano"], span["endTimeUnixNano"]);
    }
}
