use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracevault_types::{Error, Result};

/// Logical schema version recorded in the schema_versions ledger.
pub const SCHEMA_VERSION: &str = "1.0";

/// Format a timestamp for storage. Fixed millisecond precision so TEXT
/// comparison orders the same as the underlying instant.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back into a `DateTime<Utc>`.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Migration(format!("Invalid stored timestamp '{}': {}", s, e)))
}

/// Apply per-connection pragmas: foreign keys, WAL, busy timeout, bounded
/// page cache. Runs on every connection the pool opens.
pub fn configure_connection(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // journal_mode returns the resulting mode as a row; in-memory databases
    // stay on "memory", which is fine.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
    conn.pragma_update(None, "busy_timeout", busy_timeout_ms as i64)?;
    // Negative cache_size is KiB; bound the page cache to 16 MiB.
    conn.pragma_update(None, "cache_size", -16_384)?;
    Ok(())
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            agent_type TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            start_time TEXT NOT NULL,
            end_time TEXT,
            duration_ms INTEGER,
            event_count INTEGER NOT NULL DEFAULT 0,
            stream_event_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            sandbox_id TEXT,
            repo_url TEXT,
            metadata TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            schema_version TEXT NOT NULL DEFAULT '1.0'
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            mode TEXT NOT NULL,
            prompt TEXT NOT NULL DEFAULT '',
            stream_data TEXT,
            sandbox_id TEXT,
            repo_url TEXT,
            metadata TEXT,
            timestamp TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS buffers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            payload TEXT NOT NULL,
            flush_attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT,
            event_id INTEGER,
            error_type TEXT NOT NULL,
            message TEXT NOT NULL,
            stack TEXT,
            severity TEXT NOT NULL DEFAULT 'medium',
            resolved INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE SET NULL,
            FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE SET NULL
        );

        CREATE TABLE IF NOT EXISTS stats (
            stat_type TEXT NOT NULL,
            stat_key TEXT NOT NULL,
            value TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY (stat_type, stat_key)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            changed_fields TEXT NOT NULL DEFAULT '[]',
            actor TEXT,
            session_id TEXT,
            reason TEXT,
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS validation_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            field_name TEXT NOT NULL,
            rule_type TEXT NOT NULL,
            rule_config TEXT NOT NULL DEFAULT '{}',
            error_message TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 100,
            UNIQUE (table_name, field_name, rule_type)
        );

        CREATE TABLE IF NOT EXISTS schema_versions (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_time DESC);
        CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_type);
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
        CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
        CREATE INDEX IF NOT EXISTS idx_events_ts ON events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
        CREATE INDEX IF NOT EXISTS idx_events_session_type_ts
            ON events(session_id, event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_buffers_session ON buffers(session_id);
        CREATE INDEX IF NOT EXISTS idx_buffers_status ON buffers(status);
        CREATE INDEX IF NOT EXISTS idx_errors_session ON errors(session_id);
        CREATE INDEX IF NOT EXISTS idx_errors_type ON errors(error_type);
        CREATE INDEX IF NOT EXISTS idx_errors_ts ON errors(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_target ON audit_log(table_name, record_id);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    ensure_current_version(conn)?;
    Ok(())
}

/// Ensure the schema_versions ledger has exactly one current row, appending
/// the running version if it is missing. The ledger itself is append-only.
fn ensure_current_version(conn: &Connection) -> Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schema_versions WHERE version = ?1",
        [SCHEMA_VERSION],
        |row| row.get(0),
    )?;

    if exists == 0 {
        conn.execute(
            "INSERT INTO schema_versions (version, applied_at, is_current) VALUES (?1, ?2, 1)",
            rusqlite::params![SCHEMA_VERSION, fmt_ts(Utc::now())],
        )?;
    }

    // Demote any other row still marked current (old engine versions).
    conn.execute(
        "UPDATE schema_versions SET is_current = (version = ?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
