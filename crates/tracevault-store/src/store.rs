use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use tracevault_types::{
    AuditContext, AuditEntry, AuditOp, BufferRecord, BufferStatus, EngineConfig, Error,
    ErrorRecord, EventFilter, EventRecord, EventType, Result, SessionFilter, SessionRecord,
    SessionStatus, StatSnapshot, StoreStatistics,
};

use crate::resources::ResourceManager;
use crate::schema::{fmt_ts, parse_ts};

/// Incremental WHERE-clause builder for the filter-driven query APIs.
struct QueryParts {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl QueryParts {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, clause: impl Into<String>, value: Box<dyn ToSql>) {
        self.params.push(value);
        let clause = clause.into().replace('?', &format!("?{}", self.params.len()));
        self.clauses.push(clause);
    }

    fn push_in(&mut self, column: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        let mut placeholders = Vec::new();
        for v in values {
            self.params.push(Box::new(v.clone()));
            placeholders.push(format!("?{}", self.params.len()));
        }
        self.clauses
            .push(format!("{} IN ({})", column, placeholders.join(", ")));
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn bind(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }
}

fn limit_sql(limit: Option<usize>, offset: Option<usize>) -> String {
    match (limit, offset) {
        (Some(l), Some(o)) => format!(" LIMIT {} OFFSET {}", l, o),
        (Some(l), None) => format!(" LIMIT {}", l),
        (None, Some(o)) => format!(" LIMIT -1 OFFSET {}", o),
        (None, None) => String::new(),
    }
}

const SESSION_COLUMNS: &str = "id, agent_type, mode, status, start_time, end_time, duration_ms, \
     event_count, stream_event_count, error_count, sandbox_id, repo_url, metadata, version, \
     schema_version";

const EVENT_COLUMNS: &str = "id, session_id, event_type, agent_type, mode, prompt, stream_data, \
     sandbox_id, repo_url, metadata, timestamp, created_at";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(3)?;
    let start: String = row.get(4)?;
    let end: Option<String> = row.get(5)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        agent_type: row.get(1)?,
        mode: row.get(2)?,
        status: status.parse().unwrap_or(SessionStatus::Active),
        start_time: parse_ts(&start).unwrap_or_else(|_| Utc::now()),
        end_time: end.as_deref().and_then(|s| parse_ts(s).ok()),
        duration_ms: row.get(6)?,
        event_count: row.get(7)?,
        stream_event_count: row.get(8)?,
        error_count: row.get(9)?,
        sandbox_id: row.get(10)?,
        repo_url: row.get(11)?,
        metadata: row.get(12)?,
        version: row.get(13)?,
        schema_version: row.get(14)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let event_type: String = row.get(2)?;
    let ts: String = row.get(10)?;
    let created: String = row.get(11)?;
    Ok(EventRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        event_type: event_type.parse().unwrap_or(EventType::Stream),
        agent_type: row.get(3)?,
        mode: row.get(4)?,
        prompt: row.get(5)?,
        stream_data: row.get(6)?,
        sandbox_id: row.get(7)?,
        repo_url: row.get(8)?,
        metadata: row.get(9)?,
        timestamp: parse_ts(&ts).unwrap_or_else(|_| Utc::now()),
        created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErrorRecord> {
    let severity: String = row.get(6)?;
    let ts: String = row.get(8)?;
    Ok(ErrorRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        event_id: row.get(2)?,
        error_type: row.get(3)?,
        message: row.get(4)?,
        stack: row.get(5)?,
        severity: severity.parse().unwrap_or(tracevault_types::ErrorSeverity::Medium),
        resolved: row.get::<_, i64>(7)? != 0,
        timestamp: parse_ts(&ts).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_buffer(row: &rusqlite::Row<'_>) -> rusqlite::Result<BufferRecord> {
    let status: String = row.get(3)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(BufferRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_type: row.get(2)?,
        status: status.parse().unwrap_or(BufferStatus::Pending),
        payload: row.get(4)?,
        flush_attempts: row.get(5)?,
        created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_ts(&updated).unwrap_or_else(|_| Utc::now()),
    })
}

/// CRUD and transactional batch operations over the fixed telemetry schema.
///
/// All access goes through the shared [`ResourceManager`]; no method holds a
/// connection across calls. Cloning shares the same resources.
#[derive(Clone)]
pub struct Store {
    resources: Arc<ResourceManager>,
}

impl Store {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self { resources }
    }

    pub fn open(path: &Path, config: EngineConfig) -> Result<Self> {
        Ok(Self::new(ResourceManager::open(path, config)?))
    }

    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        Ok(Self::new(ResourceManager::open_in_memory(config)?))
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Insert or update a session row. Updates bump the version counter and
    /// coalesce optional fields rather than clearing them.
    pub fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.resources.acquire()?;
        let started = Instant::now();
        let sql = r#"
            INSERT INTO sessions (id, agent_type, mode, status, start_time, end_time,
                                  duration_ms, sandbox_id, repo_url, metadata, version,
                                  schema_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)
            ON CONFLICT(id) DO UPDATE SET
                agent_type = ?2,
                mode = ?3,
                status = ?4,
                end_time = COALESCE(?6, end_time),
                duration_ms = COALESCE(?7, duration_ms),
                sandbox_id = COALESCE(?8, sandbox_id),
                repo_url = COALESCE(?9, repo_url),
                metadata = COALESCE(?10, metadata),
                version = version + 1,
                schema_version = ?11
            "#;
        conn.prepare_cached(sql)?.execute(params![
            record.id,
            record.agent_type,
            record.mode,
            record.status.as_str(),
            fmt_ts(record.start_time),
            record.end_time.map(fmt_ts),
            record.duration_ms,
            record.sandbox_id,
            record.repo_url,
            record.metadata,
            record.schema_version,
        ])?;
        self.resources.record_statement(sql, started.elapsed());
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.resources.acquire()?;
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        let session = conn
            .prepare_cached(&sql)?
            .query_row([session_id], row_to_session)
            .optional()?;
        Ok(session)
    }

    /// Update a session's terminal status; recomputed stats fill duration.
    pub fn set_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.resources.acquire()?;
        conn.prepare_cached(
            "UPDATE sessions SET status = ?2, version = version + 1 WHERE id = ?1",
        )?
        .execute(params![session_id, status.as_str()])?;
        Ok(())
    }

    pub fn insert_event(&self, event: &EventRecord) -> Result<i64> {
        let mut conn = self.resources.acquire()?;
        let tx = conn.transaction()?;
        let id = insert_event_tx(&tx, event)?;
        tx.commit()?;
        Ok(id)
    }

    /// Transactionally insert a batch of events, then recompute counters,
    /// duration, and end_time for every affected session inside the same
    /// transaction. Recomputation is full, not incremental; correctness
    /// under concurrent writers wins over write cost.
    pub fn insert_event_batch(&self, events: &[EventRecord]) -> Result<Vec<i64>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.resources.acquire()?;
        let started = Instant::now();
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(insert_event_tx(&tx, event)?);
        }

        let mut sessions: Vec<&str> = events.iter().map(|e| e.session_id.as_str()).collect();
        sessions.sort_unstable();
        sessions.dedup();
        for session_id in sessions {
            recompute_session_stats_tx(&tx, session_id)?;
        }

        tx.commit()?;
        self.resources
            .record_statement("INSERT INTO events (batch)", started.elapsed());
        Ok(ids)
    }

    /// Re-derive a session's counters and timing from its events.
    pub fn update_session_stats(&self, session_id: &str) -> Result<()> {
        let mut conn = self.resources.acquire()?;
        let tx = conn.transaction()?;
        recompute_session_stats_tx(&tx, session_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn query_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        let mut parts = QueryParts::new();
        if let Some(from) = filter.from {
            parts.push("start_time >= ?", Box::new(fmt_ts(from)));
        }
        if let Some(to) = filter.to {
            parts.push("start_time <= ?", Box::new(fmt_ts(to)));
        }
        parts.push_in("id", &filter.session_ids);
        parts.push_in("agent_type", &filter.agent_types);
        parts.push_in("mode", &filter.modes);
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        parts.push_in("status", &statuses);

        let sql = format!(
            "SELECT {} FROM sessions{} ORDER BY start_time {}{}",
            SESSION_COLUMNS,
            parts.where_sql(),
            filter.order.as_sql(),
            limit_sql(filter.limit, filter.offset),
        );

        let conn = self.resources.acquire()?;
        let started = Instant::now();
        let mut stmt = conn.prepare_cached(&sql)?;
        let sessions = stmt
            .query_map(&parts.bind()[..], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.resources.record_statement(&sql, started.elapsed());
        Ok(sessions)
    }

    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let mut parts = QueryParts::new();
        if let Some(from) = filter.from {
            parts.push("timestamp >= ?", Box::new(fmt_ts(from)));
        }
        if let Some(to) = filter.to {
            parts.push("timestamp <= ?", Box::new(fmt_ts(to)));
        }
        parts.push_in("session_id", &filter.session_ids);
        let types: Vec<String> = filter
            .event_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        parts.push_in("event_type", &types);
        parts.push_in("agent_type", &filter.agent_types);
        parts.push_in("mode", &filter.modes);

        let sql = format!(
            "SELECT {} FROM events{} ORDER BY timestamp {}, id {}{}",
            EVENT_COLUMNS,
            parts.where_sql(),
            filter.order.as_sql(),
            filter.order.as_sql(),
            limit_sql(filter.limit, filter.offset),
        );

        let conn = self.resources.acquire()?;
        let started = Instant::now();
        let mut stmt = conn.prepare_cached(&sql)?;
        let events = stmt
            .query_map(&parts.bind()[..], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.resources.record_statement(&sql, started.elapsed());
        Ok(events)
    }

    pub fn insert_error(&self, error: &ErrorRecord) -> Result<i64> {
        let conn = self.resources.acquire()?;
        conn.prepare_cached(
            r#"
            INSERT INTO errors (session_id, event_id, error_type, message, stack,
                                severity, resolved, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )?
        .execute(params![
            error.session_id,
            error.event_id,
            error.error_type,
            error.message,
            error.stack,
            error.severity.as_str(),
            error.resolved as i64,
            fmt_ts(error.timestamp),
        ])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn query_errors(
        &self,
        from: Option<chrono::DateTime<Utc>>,
        to: Option<chrono::DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<ErrorRecord>> {
        let mut parts = QueryParts::new();
        if let Some(from) = from {
            parts.push("timestamp >= ?", Box::new(fmt_ts(from)));
        }
        if let Some(to) = to {
            parts.push("timestamp <= ?", Box::new(fmt_ts(to)));
        }
        let sql = format!(
            "SELECT id, session_id, event_id, error_type, message, stack, severity, resolved, \
             timestamp FROM errors{} ORDER BY timestamp DESC{}",
            parts.where_sql(),
            limit_sql(limit, None),
        );

        let conn = self.resources.acquire()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let errors = stmt
            .query_map(&parts.bind()[..], row_to_error)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    /// Upsert-replace a stats snapshot; the (type, key) pair is unique and
    /// a row is never partially written.
    pub fn upsert_stat(&self, snapshot: &StatSnapshot) -> Result<()> {
        let conn = self.resources.acquire()?;
        conn.prepare_cached(
            r#"
            INSERT INTO stats (stat_type, stat_key, value, computed_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(stat_type, stat_key) DO UPDATE SET
                value = ?3,
                computed_at = ?4
            "#,
        )?
        .execute(params![
            snapshot.stat_type,
            snapshot.stat_key,
            snapshot.value,
            fmt_ts(snapshot.computed_at),
        ])?;
        Ok(())
    }

    pub fn get_stat(&self, stat_type: &str, stat_key: &str) -> Result<Option<StatSnapshot>> {
        let conn = self.resources.acquire()?;
        let snapshot = conn
            .prepare_cached(
                "SELECT stat_type, stat_key, value, computed_at FROM stats
                 WHERE stat_type = ?1 AND stat_key = ?2",
            )?
            .query_row([stat_type, stat_key], |row| {
                let computed: String = row.get(3)?;
                Ok(StatSnapshot {
                    stat_type: row.get(0)?,
                    stat_key: row.get(1)?,
                    value: row.get(2)?,
                    computed_at: parse_ts(&computed).unwrap_or_else(|_| Utc::now()),
                })
            })
            .optional()?;
        Ok(snapshot)
    }

    pub fn list_stats(&self) -> Result<Vec<StatSnapshot>> {
        let conn = self.resources.acquire()?;
        let mut stmt = conn.prepare_cached(
            "SELECT stat_type, stat_key, value, computed_at FROM stats
             ORDER BY stat_type, stat_key",
        )?;
        let stats = stmt
            .query_map([], |row| {
                let computed: String = row.get(3)?;
                Ok(StatSnapshot {
                    stat_type: row.get(0)?,
                    stat_key: row.get(1)?,
                    value: row.get(2)?,
                    computed_at: parse_ts(&computed).unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    pub fn list_buffers(&self) -> Result<Vec<BufferRecord>> {
        let conn = self.resources.acquire()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, agent_type, status, payload, flush_attempts,
                    created_at, updated_at
             FROM buffers ORDER BY created_at",
        )?;
        let buffers = stmt
            .query_map([], row_to_buffer)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(buffers)
    }

    pub fn list_audit(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let conn = self.resources.acquire()?;
        let sql = format!(
            "SELECT id, table_name, record_id, operation, old_value, new_value,
                    changed_fields, actor, session_id, reason, timestamp
             FROM audit_log ORDER BY timestamp{}",
            limit_sql(limit, None),
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let entries = stmt
            .query_map([], |row| {
                let operation: String = row.get(3)?;
                let ts: String = row.get(10)?;
                Ok(AuditEntry {
                    id: row.get(0)?,
                    table_name: row.get(1)?,
                    record_id: row.get(2)?,
                    operation: operation.parse().unwrap_or(AuditOp::Update),
                    old_value: row.get(4)?,
                    new_value: row.get(5)?,
                    changed_fields: row.get(6)?,
                    context: AuditContext {
                        actor: row.get(7)?,
                        session_id: row.get(8)?,
                        reason: row.get(9)?,
                    },
                    timestamp: parse_ts(&ts).unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Create or replace the pending buffer row for a (session, agent) pair
    /// with the serialized event payload.
    pub fn save_buffer(&self, session_id: &str, agent_type: &str, payload: &str) -> Result<i64> {
        let conn = self.resources.acquire()?;
        let now = fmt_ts(Utc::now());

        let existing: Option<i64> = conn
            .prepare_cached(
                "SELECT id FROM buffers
                 WHERE session_id = ?1 AND agent_type = ?2 AND status = 'pending'",
            )?
            .query_row(params![session_id, agent_type], |row| row.get(0))
            .optional()?;

        match existing {
            Some(id) => {
                conn.prepare_cached(
                    "UPDATE buffers SET payload = ?2, updated_at = ?3 WHERE id = ?1",
                )?
                .execute(params![id, payload, now])?;
                Ok(id)
            }
            None => {
                conn.prepare_cached(
                    "INSERT INTO buffers (session_id, agent_type, status, payload,
                                          flush_attempts, created_at, updated_at)
                     VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?4)",
                )?
                .execute(params![session_id, agent_type, payload, now])?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn pending_buffers(&self, session_id: &str) -> Result<Vec<BufferRecord>> {
        let conn = self.resources.acquire()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, agent_type, status, payload, flush_attempts,
                    created_at, updated_at
             FROM buffers WHERE session_id = ?1 AND status = 'pending'
             ORDER BY created_at",
        )?;
        let buffers = stmt
            .query_map([session_id], row_to_buffer)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(buffers)
    }

    /// Flush every pending buffer for a session: parse the payload,
    /// batch-insert its events, and mark the buffer flushed, all in one
    /// transaction per buffer, so a buffer either persists entirely or not
    /// at all. Parse/insert failures mark the buffer failed and bump its
    /// attempt counter without raising; only infrastructure failures (no
    /// connection) surface. Returns the number of events persisted.
    pub fn flush_buffer(&self, session_id: &str) -> Result<usize> {
        let buffers = self.pending_buffers(session_id)?;
        let mut persisted = 0;

        for buffer in buffers {
            match self.flush_one_buffer(&buffer) {
                Ok(count) => persisted += count,
                Err(e) => {
                    warn!(
                        session_id,
                        buffer_id = buffer.id,
                        error = %e,
                        "buffer flush failed, marking buffer failed"
                    );
                    self.mark_buffer_failed(buffer.id)?;
                }
            }
        }

        Ok(persisted)
    }

    fn flush_one_buffer(&self, buffer: &BufferRecord) -> Result<usize> {
        let events: Vec<EventRecord> = serde_json::from_str(&buffer.payload)?;

        let mut conn = self.resources.acquire()?;
        let tx = conn.transaction()?;
        for event in &events {
            insert_event_tx(&tx, event)?;
        }
        tx.execute(
            "UPDATE buffers SET status = 'flushed', updated_at = ?2 WHERE id = ?1",
            params![buffer.id, fmt_ts(Utc::now())],
        )?;
        recompute_session_stats_tx(&tx, &buffer.session_id)?;
        tx.commit()?;
        Ok(events.len())
    }

    fn mark_buffer_failed(&self, buffer_id: i64) -> Result<()> {
        let conn = self.resources.acquire()?;
        conn.prepare_cached(
            "UPDATE buffers SET status = 'failed', flush_attempts = flush_attempts + 1,
                                updated_at = ?2
             WHERE id = ?1",
        )?
        .execute(params![buffer_id, fmt_ts(Utc::now())])?;
        Ok(())
    }

    /// Delete flushed/failed buffer rows older than the given cutoff.
    pub fn prune_buffers(&self, before: chrono::DateTime<Utc>) -> Result<usize> {
        let conn = self.resources.acquire()?;
        let n = conn
            .prepare_cached(
                "DELETE FROM buffers WHERE status != 'pending' AND updated_at < ?1",
            )?
            .execute([fmt_ts(before)])?;
        Ok(n)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let conn = self.resources.acquire()?;
        let n = conn
            .prepare_cached("DELETE FROM sessions WHERE id = ?1")?
            .execute([session_id])?;
        Ok(n > 0)
    }

    /// Global counts and breakdowns for dashboards and monitoring.
    pub fn get_statistics(&self) -> Result<StoreStatistics> {
        let conn = self.resources.acquire()?;
        let mut stats = StoreStatistics::default();

        stats.session_count =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        stats.event_count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        stats.error_count = conn.query_row("SELECT COUNT(*) FROM errors", [], |row| row.get(0))?;
        stats.pending_buffer_count = conn.query_row(
            "SELECT COUNT(*) FROM buffers WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;

        let breakdown = |sql: &str| -> Result<Vec<(String, i64)>> {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        };

        stats.sessions_by_status = breakdown(
            "SELECT status, COUNT(*) FROM sessions GROUP BY status ORDER BY status",
        )?;
        stats.events_by_type = breakdown(
            "SELECT event_type, COUNT(*) FROM events GROUP BY event_type ORDER BY event_type",
        )?;
        stats.sessions_by_agent = breakdown(
            "SELECT agent_type, COUNT(*) FROM sessions GROUP BY agent_type ORDER BY agent_type",
        )?;

        stats.db_size_bytes = conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;

        Ok(stats)
    }

    /// Transactional full wipe of telemetry data, followed by VACUUM to
    /// reclaim space. Idempotent: wiping an empty store is a no-op.
    pub fn clear_all_data(&self) -> Result<()> {
        let mut conn = self.resources.acquire()?;
        let tx = conn.transaction()?;
        // Children first; FK enforcement stays on.
        tx.execute("DELETE FROM errors", [])?;
        tx.execute("DELETE FROM buffers", [])?;
        tx.execute("DELETE FROM events", [])?;
        tx.execute("DELETE FROM sessions", [])?;
        tx.execute("DELETE FROM stats", [])?;
        tx.execute("DELETE FROM audit_log", [])?;
        tx.commit()?;

        conn.execute("VACUUM", []).map_err(Error::from)?;
        self.resources.result_cache().clear();
        Ok(())
    }
}

fn insert_event_tx(tx: &Transaction<'_>, event: &EventRecord) -> Result<i64> {
    tx.prepare_cached(
        r#"
        INSERT INTO events (session_id, event_type, agent_type, mode, prompt, stream_data,
                            sandbox_id, repo_url, metadata, timestamp, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )?
    .execute(params![
        event.session_id,
        event.event_type.as_str(),
        event.agent_type,
        event.mode,
        event.prompt,
        event.stream_data,
        event.sandbox_id,
        event.repo_url,
        event.metadata,
        fmt_ts(event.timestamp),
        fmt_ts(event.created_at),
    ])?;
    Ok(tx.last_insert_rowid())
}

/// Count events by type for the session and derive duration/end_time from
/// the event timestamps. Runs inside the caller's transaction.
fn recompute_session_stats_tx(tx: &Transaction<'_>, session_id: &str) -> Result<()> {
    let (total, streams, errors, min_ts, max_ts): (i64, i64, i64, Option<String>, Option<String>) =
        tx.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(event_type = 'stream'), 0),
                   COALESCE(SUM(event_type = 'error'), 0),
                   MIN(timestamp),
                   MAX(timestamp)
            FROM events WHERE session_id = ?1
            "#,
            [session_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;

    let duration_ms = match (&min_ts, &max_ts) {
        (Some(min), Some(max)) => {
            let min = parse_ts(min)?;
            let max = parse_ts(max)?;
            Some((max - min).num_milliseconds())
        }
        _ => None,
    };

    tx.execute(
        r#"
        UPDATE sessions
        SET event_count = ?2,
            stream_event_count = ?3,
            error_count = ?4,
            end_time = COALESCE(?5, end_time),
            duration_ms = COALESCE(?6, duration_ms),
            version = version + 1
        WHERE id = ?1
        "#,
        params![session_id, total, streams, errors, max_ts, duration_ms],
    )?;

    Ok(())
}
