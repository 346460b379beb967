// Analytics and export engine: reads the telemetry store, never writes
// session/event data. Results are cached with per-query TTLs.

mod analytics;
mod export;

pub use analytics::{
    AnalyticsEngine, Anomaly, AnomalyKind, PercentileSet, PerformanceMetrics, RealTimeMetrics,
    SessionSummary, TimeBucket,
};
pub use export::{
    Compression, ExportConfig, ExportFormat, ExportMetadata, ExportService, ExportTable,
};
