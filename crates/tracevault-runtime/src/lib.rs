// Ingest, buffering, batching, and monitoring around the telemetry store,
// fronted by the TelemetryEngine handle external callers consume.

mod batch;
mod buffers;
mod engine;
mod monitor;
mod timer;

pub use batch::{BatchOutcome, BatchQueue, CompletionHook};
pub use buffers::StreamBuffers;
pub use engine::TelemetryEngine;
pub use monitor::{Alert, Metric, PerformanceMonitor, Thresholds, TrendPrediction};
