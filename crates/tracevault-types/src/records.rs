use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema tag written into every row that carries an opaque metadata blob.
/// Bumped when the metadata payload shape changes; readers branch on it.
pub const METADATA_SCHEMA_VERSION: &str = "1.0";

/// Lifecycle status of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "timeout" => Ok(SessionStatus::Timeout),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of lifecycle event emitted by a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Stream,
    End,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Stream => "stream",
            EventType::End => "end",
            EventType::Error => "error",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(EventType::Start),
            "stream" => Ok(EventType::Stream),
            "end" => Ok(EventType::End),
            "error" => Ok(EventType::Error),
            _ => Err(format!("Unknown event type: {}", s)),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flush state of a persisted stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    Pending,
    Flushed,
    Failed,
}

impl BufferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferStatus::Pending => "pending",
            BufferStatus::Flushed => "flushed",
            BufferStatus::Failed => "failed",
        }
    }
}

impl FromStr for BufferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BufferStatus::Pending),
            "flushed" => Ok(BufferStatus::Flushed),
            "failed" => Ok(BufferStatus::Failed),
            _ => Err(format!("Unknown buffer status: {}", s)),
        }
    }
}

/// Severity of a recorded error. Ordering is ascending, so `Critical`
/// compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl FromStr for ErrorSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ErrorSeverity::Low),
            "medium" => Ok(ErrorSeverity::Medium),
            "high" => Ok(ErrorSeverity::High),
            "critical" => Ok(ErrorSeverity::Critical),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Complete session record as stored in the `sessions` table.
///
/// Counters are derived state: they are recomputed from the `events` table
/// after every batch insert rather than maintained incrementally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque session identifier assigned by the orchestrator.
    pub id: String,
    /// Agent type (claude, codex, gemini, ...).
    pub agent_type: String,
    /// Execution mode the orchestrator ran the agent in.
    pub mode: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start_time and end_time, when both are set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub event_count: i64,
    pub stream_event_count: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Opaque metadata blob; interpreted only by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    /// Optimistic-concurrency version, bumped on every update.
    pub version: i64,
    /// Schema tag for the metadata blob.
    pub schema_version: String,
}

/// Immutable event record as stored in the `events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Auto-increment row id; 0 before insertion.
    #[serde(default)]
    pub id: i64,
    pub session_id: String,
    pub event_type: EventType,
    pub agent_type: String,
    pub mode: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Durable buffer row backing an in-memory stream buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferRecord {
    #[serde(default)]
    pub id: i64,
    pub session_id: String,
    pub agent_type: String,
    pub status: BufferStatus,
    /// JSON array of buffered events, serialized at buffer-creation time.
    pub payload: String,
    pub flush_attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only error record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub severity: ErrorSeverity,
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
}

/// Pre-computed aggregate keyed by (stat_type, stat_key).
///
/// Upsert-replace semantics: a recompute writes the whole row or nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub stat_type: String,
    pub stat_key: String,
    /// JSON value of the aggregate.
    pub value: String,
    pub computed_at: DateTime<Utc>,
}

/// Mutation operation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOp {
    Insert,
    Update,
    Delete,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOp::Insert => "INSERT",
            AuditOp::Update => "UPDATE",
            AuditOp::Delete => "DELETE",
        }
    }
}

impl FromStr for AuditOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(AuditOp::Insert),
            "UPDATE" => Ok(AuditOp::Update),
            "DELETE" => Ok(AuditOp::Delete),
            _ => Err(format!("Unknown audit operation: {}", s)),
        }
    }
}

/// Who/why context attached to an audit entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Append-only audit log entry with before/after snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: AuditOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    /// JSON array of field names that differ between old and new.
    pub changed_fields: String,
    #[serde(flatten)]
    pub context: AuditContext,
    pub timestamp: DateTime<Utc>,
}

/// Field-validation rule kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Required,
    Pattern,
    Range,
    Enum,
    Length,
    JsonSchema,
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "required" => Ok(RuleType::Required),
            "pattern" => Ok(RuleType::Pattern),
            "range" => Ok(RuleType::Range),
            "enum" => Ok(RuleType::Enum),
            "length" => Ok(RuleType::Length),
            "json_schema" => Ok(RuleType::JsonSchema),
            _ => Err(format!("Unknown rule type: {}", s)),
        }
    }
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Required => "required",
            RuleType::Pattern => "pattern",
            RuleType::Range => "range",
            RuleType::Enum => "enum",
            RuleType::Length => "length",
            RuleType::JsonSchema => "json_schema",
        }
    }
}

/// A single validation rule loaded from the `validation_rules` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub id: i64,
    pub table_name: String,
    pub field_name: String,
    pub rule_type: RuleType,
    /// JSON rule configuration (bounds, pattern, allowed values, ...).
    pub rule_config: String,
    pub error_message: String,
    pub active: bool,
    /// Lower runs first.
    pub priority: i64,
}

/// One row of the schema-version ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersionRow {
    pub version: String,
    pub applied_at: DateTime<Utc>,
    pub is_current: bool,
}

/// Global counters returned by `get_statistics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub session_count: i64,
    pub event_count: i64,
    pub error_count: i64,
    pub pending_buffer_count: i64,
    pub sessions_by_status: Vec<(String, i64)>,
    pub events_by_type: Vec<(String, i64)>,
    pub sessions_by_agent: Vec<(String, i64)>,
    /// Database file size derived from page_count * page_size.
    pub db_size_bytes: i64,
    /// Events dropped by the best-effort persistence policy since startup.
    pub events_dropped: u64,
}
