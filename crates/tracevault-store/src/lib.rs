// SQLite storage layer for the tracevault telemetry engine.
//
// The connection pool is the single point of serialized access to the
// store; statement and result caches are process-wide and shared under the
// same discipline. Schema is fixed: this is not a general-purpose database.

mod cache;
mod integrity;
mod memory;
mod pool;
mod resources;
mod schema;
mod store;

pub use cache::{CacheStats, ResultCache, StatementStats, StatementUsage};
pub use integrity::{IntegrityReport, IntegrityService};
pub use memory::{MemoryMonitor, PressureEvent, PressureLevel};
pub use pool::{ConnectionPool, PooledConnection};
pub use resources::{ResourceManager, ResourceMetrics};
pub use schema::{fmt_ts, parse_ts, SCHEMA_VERSION};
pub use store::Store;
