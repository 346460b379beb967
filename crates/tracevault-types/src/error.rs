use std::fmt;

/// Result type for tracevault operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A single validation-rule failure. A validation error aggregates every
/// violation found on the record before failing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Violation {
    pub table: String,
    pub field: String,
    pub rule_type: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} [{}]: {}",
            self.table, self.field, self.rule_type, self.message
        )
    }
}

/// Machine-readable export failure codes, surfaced before any I/O happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportErrorCode {
    InvalidFormat,
    MissingOutputPath,
    InvalidDelimiter,
    RenderFailed,
    WriteFailed,
}

impl ExportErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportErrorCode::InvalidFormat => "INVALID_FORMAT",
            ExportErrorCode::MissingOutputPath => "MISSING_OUTPUT_PATH",
            ExportErrorCode::InvalidDelimiter => "INVALID_DELIMITER",
            ExportErrorCode::RenderFailed => "RENDER_FAILED",
            ExportErrorCode::WriteFailed => "WRITE_FAILED",
        }
    }
}

/// Error types that can occur anywhere in the engine.
///
/// The split matters to callers: `Validation` and `Audit` propagate out of
/// the ingest API, while raw persistence failures are logged and swallowed
/// by the runtime layer (best-effort policy).
#[derive(Debug)]
pub enum Error {
    /// Pool or database initialization failed; fatal to the engine instance.
    Connection(String),

    /// Connection acquisition exceeded the configured timeout.
    ConnectionTimeout { waited_ms: u64 },

    /// Schema migration failed at startup; fatal.
    Migration(String),

    /// One or more validation rules failed on a record.
    Validation(Vec<Violation>),

    /// An audit write failed; treated as a data-integrity incident.
    Audit(String),

    /// Export failed with a machine-readable code.
    Export {
        code: ExportErrorCode,
        message: String,
    },

    /// The batch queue refused a new item past its hard capacity.
    QueueFull { pending: usize, capacity: usize },

    /// Underlying database operation failed.
    Database(rusqlite::Error),

    /// IO operation failed.
    Io(std::io::Error),

    /// Serialization or deserialization failed.
    Serialization(serde_json::Error),

    /// Invalid operation or argument (unknown metric, bad state).
    InvalidOperation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::ConnectionTimeout { waited_ms } => {
                write!(f, "Connection acquisition timed out after {}ms", waited_ms)
            }
            Error::Migration(msg) => write!(f, "Migration error: {}", msg),
            Error::Validation(violations) => {
                write!(f, "Validation failed ({} violation(s): ", violations.len())?;
                for (i, v) in violations.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            Error::Audit(msg) => write!(f, "Audit error: {}", msg),
            Error::Export { code, message } => {
                write!(f, "Export error [{}]: {}", code.as_str(), message)
            }
            Error::QueueFull { pending, capacity } => {
                write!(f, "Queue full: {} pending, capacity {}", pending, capacity)
            }
            Error::Database(err) => write!(f, "Database error: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Serialization(err) => write!(f, "Serialization error: {}", err),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_aggregates_violations() {
        let err = Error::Validation(vec![
            Violation {
                table: "sessions".to_string(),
                field: "id".to_string(),
                rule_type: "required".to_string(),
                message: "id is required".to_string(),
            },
            Violation {
                table: "sessions".to_string(),
                field: "status".to_string(),
                rule_type: "enum".to_string(),
                message: "unknown status".to_string(),
            },
        ]);

        let msg = err.to_string();
        assert!(msg.contains("2 violation(s)"));
        assert!(msg.contains("sessions.id"));
        assert!(msg.contains("sessions.status"));
    }

    #[test]
    fn test_export_error_carries_code() {
        let err = Error::Export {
            code: ExportErrorCode::InvalidDelimiter,
            message: "delimiter must be a single character".to_string(),
        };
        assert!(err.to_string().contains("INVALID_DELIMITER"));
    }
}
