// Core data model for the tracevault telemetry engine.
// Records mirror the SQLite schema; requests are the typed ingest surface.

pub mod config;
pub mod error;
pub mod filter;
pub mod records;
pub mod requests;

pub use config::EngineConfig;
pub use error::{Error, ExportErrorCode, Result, Violation};
pub use filter::{EventFilter, ExportFilter, SessionFilter, SortOrder};
pub use records::*;
pub use requests::{EndRequest, ErrorRequest, StartRequest, StreamRequest};
