use serde::{Deserialize, Serialize};

// One explicit request struct per event kind: the ingest API takes these
// instead of positional/overloaded call shapes. Compatibility adapters, if
// any, live at the caller's boundary.

/// Request to open a session and persist its `start` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub session_id: String,
    pub agent_type: String,
    pub mode: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Request to append a stream chunk; buffered in memory until flushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub session_id: String,
    pub agent_type: String,
    pub mode: String,
    pub prompt: String,
    pub stream_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Request to close a session. Force-flushes the session's buffer first so
/// the terminal event observes all prior stream data in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndRequest {
    pub session_id: String,
    pub agent_type: String,
    pub mode: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// Request to record a session failure. Same flush ordering as `EndRequest`,
/// plus an error record appended to the errors table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRequest {
    pub session_id: String,
    pub agent_type: String,
    pub mode: String,
    pub prompt: String,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}
