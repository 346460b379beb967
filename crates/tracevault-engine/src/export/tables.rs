//! CSV rendering, one file per exported table.
//!
//! Columns are written by hand rather than via serde so that optional
//! fields always occupy a column; the `csv` crate handles quoting and
//! delimiter escaping.

use tracevault_store::fmt_ts;
use tracevault_types::{Error, ExportErrorCode, Result};

use super::compress::OutputWriter;
use super::{Dataset, ExportTable};

pub(super) fn write_table(
    writer: OutputWriter,
    table: ExportTable,
    dataset: &Dataset,
    delimiter: u8,
) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(writer);

    match table {
        ExportTable::Sessions => write_sessions(&mut wtr, dataset)?,
        ExportTable::Events => write_events(&mut wtr, dataset)?,
        ExportTable::Errors => write_errors(&mut wtr, dataset)?,
        ExportTable::Stats => write_stats(&mut wtr, dataset)?,
        ExportTable::Buffers => write_buffers(&mut wtr, dataset)?,
        ExportTable::AuditLog => write_audit(&mut wtr, dataset)?,
    }

    let writer = wtr
        .into_inner()
        .map_err(|e| render_failed(e.to_string()))?;
    writer.finish()
}

type CsvWriter = csv::Writer<OutputWriter>;

fn write_sessions(wtr: &mut CsvWriter, dataset: &Dataset) -> Result<()> {
    wtr.write_record([
        "id",
        "agent_type",
        "mode",
        "status",
        "start_time",
        "end_time",
        "duration_ms",
        "event_count",
        "stream_event_count",
        "error_count",
        "sandbox_id",
        "repo_url",
        "metadata",
        "version",
        "schema_version",
    ])
    .map_err(csv_error)?;

    for s in &dataset.sessions {
        wtr.write_record([
            s.id.as_str(),
            s.agent_type.as_str(),
            s.mode.as_str(),
            s.status.as_str(),
            &fmt_ts(s.start_time),
            &s.end_time.map(fmt_ts).unwrap_or_default(),
            &s.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
            &s.event_count.to_string(),
            &s.stream_event_count.to_string(),
            &s.error_count.to_string(),
            s.sandbox_id.as_deref().unwrap_or(""),
            s.repo_url.as_deref().unwrap_or(""),
            s.metadata.as_deref().unwrap_or(""),
            &s.version.to_string(),
            s.schema_version.as_str(),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush().map_err(|e| render_failed(e.to_string()))
}

fn write_events(wtr: &mut CsvWriter, dataset: &Dataset) -> Result<()> {
    wtr.write_record([
        "id",
        "session_id",
        "event_type",
        "agent_type",
        "mode",
        "prompt",
        "stream_data",
        "sandbox_id",
        "repo_url",
        "metadata",
        "timestamp",
        "created_at",
    ])
    .map_err(csv_error)?;

    for e in &dataset.events {
        wtr.write_record([
            &e.id.to_string(),
            e.session_id.as_str(),
            e.event_type.as_str(),
            e.agent_type.as_str(),
            e.mode.as_str(),
            e.prompt.as_str(),
            e.stream_data.as_deref().unwrap_or(""),
            e.sandbox_id.as_deref().unwrap_or(""),
            e.repo_url.as_deref().unwrap_or(""),
            e.metadata.as_deref().unwrap_or(""),
            &fmt_ts(e.timestamp),
            &fmt_ts(e.created_at),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush().map_err(|e| render_failed(e.to_string()))
}

fn write_errors(wtr: &mut CsvWriter, dataset: &Dataset) -> Result<()> {
    wtr.write_record([
        "id",
        "session_id",
        "event_id",
        "error_type",
        "message",
        "stack",
        "severity",
        "resolved",
        "timestamp",
    ])
    .map_err(csv_error)?;

    for e in &dataset.errors {
        wtr.write_record([
            &e.id.to_string(),
            e.session_id.as_deref().unwrap_or(""),
            &e.event_id.map(|id| id.to_string()).unwrap_or_default(),
            e.error_type.as_str(),
            e.message.as_str(),
            e.stack.as_deref().unwrap_or(""),
            e.severity.as_str(),
            &e.resolved.to_string(),
            &fmt_ts(e.timestamp),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush().map_err(|e| render_failed(e.to_string()))
}

fn write_stats(wtr: &mut CsvWriter, dataset: &Dataset) -> Result<()> {
    wtr.write_record(["stat_type", "stat_key", "value", "computed_at"])
        .map_err(csv_error)?;

    for s in &dataset.stats {
        wtr.write_record([
            s.stat_type.as_str(),
            s.stat_key.as_str(),
            s.value.as_str(),
            &fmt_ts(s.computed_at),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush().map_err(|e| render_failed(e.to_string()))
}

fn write_buffers(wtr: &mut CsvWriter, dataset: &Dataset) -> Result<()> {
    wtr.write_record([
        "id",
        "session_id",
        "agent_type",
        "status",
        "payload",
        "flush_attempts",
        "created_at",
        "updated_at",
    ])
    .map_err(csv_error)?;

    for b in &dataset.buffers {
        wtr.write_record([
            &b.id.to_string(),
            b.session_id.as_str(),
            b.agent_type.as_str(),
            b.status.as_str(),
            b.payload.as_str(),
            &b.flush_attempts.to_string(),
            &fmt_ts(b.created_at),
            &fmt_ts(b.updated_at),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush().map_err(|e| render_failed(e.to_string()))
}

fn write_audit(wtr: &mut CsvWriter, dataset: &Dataset) -> Result<()> {
    wtr.write_record([
        "id",
        "table_name",
        "record_id",
        "operation",
        "old_value",
        "new_value",
        "changed_fields",
        "actor",
        "session_id",
        "reason",
        "timestamp",
    ])
    .map_err(csv_error)?;

    for a in &dataset.audit {
        wtr.write_record([
            &a.id.to_string(),
            a.table_name.as_str(),
            a.record_id.as_str(),
            a.operation.as_str(),
            a.old_value.as_deref().unwrap_or(""),
            a.new_value.as_deref().unwrap_or(""),
            a.changed_fields.as_str(),
            a.context.actor.as_deref().unwrap_or(""),
            a.context.session_id.as_deref().unwrap_or(""),
            a.context.reason.as_deref().unwrap_or(""),
            &fmt_ts(a.timestamp),
        ])
        .map_err(csv_error)?;
    }
    wtr.flush().map_err(|e| render_failed(e.to_string()))
}

fn csv_error(e: csv::Error) -> Error {
    render_failed(e.to_string())
}

fn render_failed(message: String) -> Error {
    Error::Export {
        code: ExportErrorCode::RenderFailed,
        message,
    }
}
