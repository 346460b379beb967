//! Filtered bulk export of the telemetry store.
//!
//! One call renders the selected tables to JSON, per-table CSV, or a
//! trace-span document, optionally compressed, and always writes a sibling
//! `<name>.metadata.json` describing what was exported. Config validation
//! runs before any file is touched.

mod compress;
mod spans;
mod tables;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use tracevault_store::Store;
use tracevault_types::{
    AuditEntry, BufferRecord, Error, ErrorRecord, EventRecord, ExportErrorCode, ExportFilter,
    Result, SessionRecord, StatSnapshot,
};

use compress::OutputWriter;

/// Rendered output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Single JSON document with per-table arrays.
    Json,
    /// One CSV file per exported table.
    Csv,
    /// Single document modelling each session as a span with child events.
    TraceSpans,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::TraceSpans => "trace_spans",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "trace_spans" => Ok(ExportFormat::TraceSpans),
            _ => Err(format!("Unknown export format: {}", s)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compression applied to rendered bytes before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Gzip,
    Brotli,
}

impl Compression {
    /// Extra filename extension appended after the format extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Brotli => "br",
        }
    }
}

/// Exportable tables. The order here is the order tables render in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportTable {
    Sessions,
    Events,
    Errors,
    Stats,
    Buffers,
    AuditLog,
}

impl ExportTable {
    pub const ALL: [ExportTable; 6] = [
        ExportTable::Sessions,
        ExportTable::Events,
        ExportTable::Errors,
        ExportTable::Stats,
        ExportTable::Buffers,
        ExportTable::AuditLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportTable::Sessions => "sessions",
            ExportTable::Events => "events",
            ExportTable::Errors => "errors",
            ExportTable::Stats => "stats",
            ExportTable::Buffers => "buffers",
            ExportTable::AuditLog => "audit_log",
        }
    }
}

/// Caller-supplied export configuration. `format` and `output_path` are kept
/// loosely typed because they typically arrive from deserialized request
/// payloads; [`ExportConfig::validate`] tightens them before any I/O.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Base filename; files are named `<name>.json`, `<name>_events.csv`, ...
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    /// Must be exactly one ASCII character.
    #[serde(default = "default_delimiter")]
    pub csv_delimiter: String,
    /// Empty means every table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<ExportTable>,
}

fn default_name() -> String {
    "export".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl ExportConfig {
    pub fn new(format: ExportFormat, output_path: impl Into<PathBuf>) -> Self {
        Self {
            format: format.as_str().to_string(),
            output_path: Some(output_path.into()),
            name: default_name(),
            compression: None,
            csv_delimiter: default_delimiter(),
            tables: Vec::new(),
        }
    }

    /// Fail-fast validation. Runs before any file is created.
    fn validate(&self) -> Result<ValidatedConfig> {
        if self.format.is_empty() {
            return Err(export_error(
                ExportErrorCode::InvalidFormat,
                "export format is required",
            ));
        }
        let format: ExportFormat = self
            .format
            .parse()
            .map_err(|e: String| export_error(ExportErrorCode::InvalidFormat, e))?;

        let output_path = match &self.output_path {
            Some(p) if !p.as_os_str().is_empty() => p.clone(),
            _ => {
                return Err(export_error(
                    ExportErrorCode::MissingOutputPath,
                    "output path is required",
                ));
            }
        };

        let mut chars = self.csv_delimiter.chars();
        let delimiter = match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() => c as u8,
            _ => {
                return Err(export_error(
                    ExportErrorCode::InvalidDelimiter,
                    format!(
                        "CSV delimiter must be a single ASCII character, got {:?}",
                        self.csv_delimiter
                    ),
                ));
            }
        };

        let tables = if self.tables.is_empty() {
            ExportTable::ALL.to_vec()
        } else {
            self.tables.clone()
        };

        Ok(ValidatedConfig {
            format,
            output_path,
            name: self.name.clone(),
            compression: self.compression,
            delimiter,
            tables,
        })
    }
}

struct ValidatedConfig {
    format: ExportFormat,
    output_path: PathBuf,
    name: String,
    compression: Option<Compression>,
    delimiter: u8,
    tables: Vec<ExportTable>,
}

impl ValidatedConfig {
    /// `<dir>/<name>[_<suffix>].<ext>[.gz|.br]`
    fn file_path(&self, suffix: Option<&str>, ext: &str) -> PathBuf {
        let mut file = match suffix {
            Some(s) => format!("{}_{}.{}", self.name, s, ext),
            None => format!("{}.{}", self.name, ext),
        };
        if let Some(c) = self.compression {
            file.push('.');
            file.push_str(c.extension());
        }
        self.output_path.join(file)
    }

    fn metadata_path(&self) -> PathBuf {
        self.output_path.join(format!("{}.metadata.json", self.name))
    }
}

/// Written alongside the export as `<name>.metadata.json` and returned to
/// the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub export_id: String,
    pub format: ExportFormat,
    pub filter: ExportFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    pub tables: Vec<ExportTable>,
    /// Records rendered per table.
    pub record_counts: BTreeMap<String, usize>,
    /// Filenames written, relative to the output path. Excludes the
    /// metadata file itself.
    pub files: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Everything selected for one export, loaded up front so every rendered
/// file observes the same snapshot of the store.
pub(super) struct Dataset {
    pub sessions: Vec<SessionRecord>,
    pub events: Vec<EventRecord>,
    pub errors: Vec<ErrorRecord>,
    pub stats: Vec<StatSnapshot>,
    pub buffers: Vec<BufferRecord>,
    pub audit: Vec<AuditEntry>,
}

/// Renders filtered slices of the store to files.
#[derive(Clone)]
pub struct ExportService {
    store: Store,
}

impl ExportService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run a full export: validate, load, render, write metadata.
    pub fn export(&self, filter: &ExportFilter, config: &ExportConfig) -> Result<ExportMetadata> {
        let validated = config.validate()?;
        let started_at = Utc::now();
        let started = Instant::now();

        let dataset = self.collect(filter, &validated.tables)?;
        let record_counts = count_records(&dataset, &validated.tables);

        let files = match validated.format {
            ExportFormat::Json => self.write_json(&dataset, &validated)?,
            ExportFormat::Csv => self.write_csv(&dataset, &validated)?,
            ExportFormat::TraceSpans => self.write_trace_spans(&dataset, &validated)?,
        };

        let metadata = ExportMetadata {
            export_id: uuid::Uuid::new_v4().to_string(),
            format: validated.format,
            filter: filter.clone(),
            compression: validated.compression,
            tables: validated.tables.clone(),
            record_counts,
            files,
            started_at,
            duration_ms: started.elapsed().as_millis() as i64,
        };
        self.write_metadata(&metadata, &validated)?;

        info!(
            export_id = %metadata.export_id,
            format = %metadata.format,
            files = metadata.files.len(),
            duration_ms = metadata.duration_ms,
            "export complete"
        );
        Ok(metadata)
    }

    fn collect(&self, filter: &ExportFilter, tables: &[ExportTable]) -> Result<Dataset> {
        let wants = |t: ExportTable| tables.contains(&t);

        let sessions = if wants(ExportTable::Sessions) {
            self.store.query_sessions(&filter.to_session_filter())?
        } else {
            Vec::new()
        };
        let events = if wants(ExportTable::Events) {
            self.store.query_events(&filter.to_event_filter())?
        } else {
            Vec::new()
        };
        let errors = if wants(ExportTable::Errors) {
            let mut errors = self.store.query_errors(filter.from, filter.to, filter.limit)?;
            if !filter.session_ids.is_empty() {
                errors.retain(|e| {
                    e.session_id
                        .as_deref()
                        .is_some_and(|id| filter.session_ids.iter().any(|s| s == id))
                });
            }
            errors
        } else {
            Vec::new()
        };
        let stats = if wants(ExportTable::Stats) {
            self.store.list_stats()?
        } else {
            Vec::new()
        };
        let buffers = if wants(ExportTable::Buffers) {
            let mut buffers = self.store.list_buffers()?;
            apply_buffer_filter(&mut buffers, filter);
            buffers
        } else {
            Vec::new()
        };
        let audit = if wants(ExportTable::AuditLog) {
            let mut audit = self.store.list_audit(filter.limit)?;
            audit.retain(|a| {
                filter.from.is_none_or(|from| a.timestamp >= from)
                    && filter.to.is_none_or(|to| a.timestamp <= to)
            });
            audit
        } else {
            Vec::new()
        };

        Ok(Dataset {
            sessions,
            events,
            errors,
            stats,
            buffers,
            audit,
        })
    }

    fn write_json(&self, dataset: &Dataset, config: &ValidatedConfig) -> Result<Vec<String>> {
        let mut doc = serde_json::Map::new();
        for table in &config.tables {
            let value = match table {
                ExportTable::Sessions => serde_json::to_value(&dataset.sessions),
                ExportTable::Events => serde_json::to_value(&dataset.events),
                ExportTable::Errors => serde_json::to_value(&dataset.errors),
                ExportTable::Stats => serde_json::to_value(&dataset.stats),
                ExportTable::Buffers => serde_json::to_value(&dataset.buffers),
                ExportTable::AuditLog => serde_json::to_value(&dataset.audit),
            }
            .map_err(|e| export_error(ExportErrorCode::RenderFailed, e.to_string()))?;
            doc.insert(table.as_str().to_string(), value);
        }

        let path = config.file_path(None, "json");
        let mut writer = OutputWriter::create(&path, config.compression)?;
        serde_json::to_writer_pretty(&mut writer, &doc)
            .map_err(|e| export_error(ExportErrorCode::RenderFailed, e.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|e| export_error(ExportErrorCode::WriteFailed, e.to_string()))?;
        writer.finish()?;
        Ok(vec![file_name(&path)])
    }

    fn write_csv(&self, dataset: &Dataset, config: &ValidatedConfig) -> Result<Vec<String>> {
        let mut files = Vec::with_capacity(config.tables.len());
        for table in &config.tables {
            let path = config.file_path(Some(table.as_str()), "csv");
            let writer = OutputWriter::create(&path, config.compression)?;
            tables::write_table(writer, *table, dataset, config.delimiter)?;
            files.push(file_name(&path));
        }
        Ok(files)
    }

    fn write_trace_spans(&self, dataset: &Dataset, config: &ValidatedConfig) -> Result<Vec<String>> {
        let doc = spans::render(&dataset.sessions, &dataset.events);
        let path = config.file_path(None, "json");
        let mut writer = OutputWriter::create(&path, config.compression)?;
        serde_json::to_writer_pretty(&mut writer, &doc)
            .map_err(|e| export_error(ExportErrorCode::RenderFailed, e.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|e| export_error(ExportErrorCode::WriteFailed, e.to_string()))?;
        writer.finish()?;
        Ok(vec![file_name(&path)])
    }

    fn write_metadata(&self, metadata: &ExportMetadata, config: &ValidatedConfig) -> Result<()> {
        let path = config.metadata_path();
        // Never compressed: the metadata file is what a consumer reads first.
        let mut writer = OutputWriter::create(&path, None)?;
        serde_json::to_writer_pretty(&mut writer, metadata)
            .map_err(|e| export_error(ExportErrorCode::RenderFailed, e.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|e| export_error(ExportErrorCode::WriteFailed, e.to_string()))?;
        writer.finish()
    }
}

fn apply_buffer_filter(buffers: &mut Vec<BufferRecord>, filter: &ExportFilter) {
    buffers.retain(|b| {
        (filter.session_ids.is_empty() || filter.session_ids.iter().any(|s| *s == b.session_id))
            && (filter.agent_types.is_empty()
                || filter.agent_types.iter().any(|a| *a == b.agent_type))
            && filter.from.is_none_or(|from| b.updated_at >= from)
            && filter.to.is_none_or(|to| b.updated_at <= to)
    });
}

fn count_records(dataset: &Dataset, tables: &[ExportTable]) -> BTreeMap<String, usize> {
    tables
        .iter()
        .map(|table| {
            let count = match table {
                ExportTable::Sessions => dataset.sessions.len(),
                ExportTable::Events => dataset.events.len(),
                ExportTable::Errors => dataset.errors.len(),
                ExportTable::Stats => dataset.stats.len(),
                ExportTable::Buffers => dataset.buffers.len(),
                ExportTable::AuditLog => dataset.audit.len(),
            };
            (table.as_str().to_string(), count)
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn export_error(code: ExportErrorCode, message: impl Into<String>) -> Error {
    Error::Export {
        code,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::fs;
    use tempfile::TempDir;
    use tracevault_types::{
        EngineConfig, ErrorSeverity, EventType, SessionStatus, METADATA_SCHEMA_VERSION,
    };

    fn session(id: &str, agent: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            agent_type: agent.to_string(),
            mode: "interactive".to_string(),
            status: SessionStatus::Active,
            start_time: Utc::now() - Duration::minutes(5),
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
        }
    }

    fn event(session_id: &str, agent: &str) -> EventRecord {
        EventRecord {
            id: 0,
            session_id: session_id.to_string(),
            event_type: EventType::Stream,
            agent_type: agent.to_string(),
            mode: "interactive".to_string(),
            prompt: "fix the bug".to_string(),
            stream_data: Some("chunk".to_string()),
            sandbox_id: None,
            repo_url: None,
            metadata: None,
            timestamp: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn fixture() -> Store {
        let store = Store::open_in_memory(EngineConfig::default()).unwrap();
        store.upsert_session(&session("s-claude", "claude")).unwrap();
        store.upsert_session(&session("s-codex", "codex")).unwrap();
        store
            .insert_event_batch(&[
                event("s-claude", "claude"),
                event("s-claude", "claude"),
                event("s-codex", "codex"),
            ])
            .unwrap();
        store
    }

    #[test]
    fn test_invalid_format_fails_before_io() {
        let dir = TempDir::new().unwrap();
        let service = ExportService::new(fixture());
        let config = ExportConfig {
            format: "xml".to_string(),
            output_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = service.export(&ExportFilter::default(), &config).unwrap_err();
        assert!(matches!(
            err,
            Error::Export {
                code: ExportErrorCode::InvalidFormat,
                ..
            }
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_output_path_fails() {
        let service = ExportService::new(fixture());
        let config = ExportConfig {
            format: "json".to_string(),
            output_path: None,
            ..Default::default()
        };
        let err = service.export(&ExportFilter::default(), &config).unwrap_err();
        assert!(matches!(
            err,
            Error::Export {
                code: ExportErrorCode::MissingOutputPath,
                ..
            }
        ));
    }

    #[test]
    fn test_multi_char_delimiter_rejected() {
        let dir = TempDir::new().unwrap();
        let service = ExportService::new(fixture());
        let mut config = ExportConfig::new(ExportFormat::Csv, dir.path());
        config.csv_delimiter = "||".to_string();
        let err = service.export(&ExportFilter::default(), &config).unwrap_err();
        assert!(matches!(
            err,
            Error::Export {
                code: ExportErrorCode::InvalidDelimiter,
                ..
            }
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_json_export_honors_agent_filter() {
        let dir = TempDir::new().unwrap();
        let service = ExportService::new(fixture());
        let filter = ExportFilter {
            agent_types: vec!["claude".to_string()],
            ..Default::default()
        };
        let config = ExportConfig::new(ExportFormat::Json, dir.path());

        let metadata = service.export(&filter, &config).unwrap();
        assert_eq!(metadata.record_counts["sessions"], 1);
        assert_eq!(metadata.record_counts["events"], 2);

        let raw = fs::read_to_string(dir.path().join("export.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["sessions"].as_array().unwrap().len(), 1);
        assert_eq!(doc["sessions"][0]["id"], "s-claude");
        assert_eq!(doc["events"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_csv_export_writes_one_file_per_table() {
        let dir = TempDir::new().unwrap();
        let service = ExportService::new(fixture());
        let config = ExportConfig::new(ExportFormat::Csv, dir.path());

        let metadata = service.export(&ExportFilter::default(), &config).unwrap();
        assert_eq!(metadata.files.len(), ExportTable::ALL.len());
        for table in ExportTable::ALL {
            let path = dir.path().join(format!("export_{}.csv", table.as_str()));
            assert!(path.exists(), "missing {}", path.display());
        }

        let sessions_csv =
            fs::read_to_string(dir.path().join("export_sessions.csv")).unwrap();
        let mut lines = sessions_csv.lines();
        assert!(lines.next().unwrap().starts_with("id,agent_type"));
        assert_eq!(lines.count(), 2);
    }

    #[test]
    fn test_csv_escapes_delimiter_in_fields() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory(EngineConfig::default()).unwrap();
        store.upsert_session(&session("s1", "claude")).unwrap();
        let mut e = event("s1", "claude");
        e.prompt = "fix a, then \"b\"".to_string();
        store.insert_event_batch(&[e]).unwrap();

        let service = ExportService::new(store);
        let mut config = ExportConfig::new(ExportFormat::Csv, dir.path());
        config.tables = vec![ExportTable::Events];
        service.export(&ExportFilter::default(), &config).unwrap();

        let raw = fs::read_to_string(dir.path().join("export_events.csv")).unwrap();
        let mut reader = csv::Reader::from_reader(raw.as_bytes());
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[5], "fix a, then \"b\"");
    }

    #[test]
    fn test_csv_errors_table_renders_flags_and_options() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory(EngineConfig::default()).unwrap();
        store.upsert_session(&session("s1", "claude")).unwrap();
        store
            .insert_error(&ErrorRecord {
                id: 0,
                session_id: Some("s1".to_string()),
                event_id: None,
                error_type: "session_error".to_string(),
                message: "sandbox died".to_string(),
                stack: None,
                severity: ErrorSeverity::High,
                resolved: false,
                timestamp: Utc::now(),
            })
            .unwrap();

        let service = ExportService::new(store);
        let mut config = ExportConfig::new(ExportFormat::Csv, dir.path());
        config.tables = vec![ExportTable::Errors];
        service.export(&ExportFilter::default(), &config).unwrap();

        let raw = fs::read_to_string(dir.path().join("export_errors.csv")).unwrap();
        let mut reader = csv::Reader::from_reader(raw.as_bytes());
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[4], "sandbox died");
        assert_eq!(&record[6], "high");
        assert_eq!(&record[7], "false");
    }

    #[test]
    fn test_gzip_output_gets_gz_extension() {
        let dir = TempDir::new().unwrap();
        let service = ExportService::new(fixture());
        let mut config = ExportConfig::new(ExportFormat::Json, dir.path());
        config.compression = Some(Compression::Gzip);

        let metadata = service.export(&ExportFilter::default(), &config).unwrap();
        assert_eq!(metadata.files, vec!["export.json.gz".to_string()]);

        let path = dir.path().join("export.json.gz");
        let compressed = fs::read(&path).unwrap();
        // gzip magic bytes
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["sessions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_metadata_file_always_written_uncompressed() {
        let dir = TempDir::new().unwrap();
        let service = ExportService::new(fixture());
        let mut config = ExportConfig::new(ExportFormat::Json, dir.path());
        config.compression = Some(Compression::Brotli);

        let metadata = service.export(&ExportFilter::default(), &config).unwrap();

        let raw = fs::read_to_string(dir.path().join("export.metadata.json")).unwrap();
        let on_disk: ExportMetadata = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk.export_id, metadata.export_id);
        assert_eq!(on_disk.record_counts["sessions"], 2);
        assert!(!on_disk.files.contains(&"export.metadata.json".to_string()));
    }

    #[test]
    fn test_trace_spans_one_span_per_session() {
        let dir = TempDir::new().unwrap();
        let service = ExportService::new(fixture());
        let config = ExportConfig::new(ExportFormat::TraceSpans, dir.path());

        service.export(&ExportFilter::default(), &config).unwrap();

        let raw = fs::read_to_string(dir.path().join("export.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let spans = doc["spans"].as_array().unwrap();
        assert_eq!(spans.len(), 2);

        let claude = spans
            .iter()
            .find(|s| s["attributes"]["session.id"] == "s-claude")
            .unwrap();
        assert_eq!(claude["events"].as_array().unwrap().len(), 2);
        assert_eq!(claude["spanId"].as_str().unwrap().len(), 16);
        assert_eq!(claude["traceId"].as_str().unwrap().len(), 32);
    }
}
