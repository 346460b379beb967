use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide configuration. Deserializable so the host platform can embed
/// it in its own config file; every field has a default tuned for a single
/// orchestrator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of simultaneously open database connections.
    pub pool_size: usize,
    /// How long `acquire` waits for a free connection before failing.
    pub connection_timeout_ms: u64,
    /// Busy timeout applied to every connection; doubles as query timeout.
    pub query_timeout_ms: u64,
    /// Prepared-statement cache capacity per connection.
    pub statement_cache_size: usize,

    /// Result-cache entry time-to-live.
    pub result_cache_ttl_ms: u64,
    /// Result-cache entry cap; least-recently-used entries evicted past it.
    pub result_cache_max_entries: usize,
    /// Rendered results larger than this are never cached.
    pub result_cache_max_value_bytes: usize,

    /// Stream-buffer item count that triggers an auto-flush.
    pub buffer_flush_threshold: usize,
    /// Period of the background flush timer.
    pub buffer_flush_interval_ms: u64,
    /// Ceiling on concurrently live stream buffers.
    pub max_concurrent_buffers: usize,

    /// Maximum items per batch handed to the store.
    pub max_batch_size: usize,
    /// Priority at or above which a queued batch flushes early.
    pub high_priority_threshold: i64,
    /// Minimum queued items for a high-priority early flush.
    pub min_batch_size: usize,
    /// Occupancy fraction above which backpressure engages.
    pub backpressure_watermark: f64,
    /// Per-item retry budget for failed batches.
    pub max_retries: u32,

    /// Estimated memory at which a pressure warning is emitted.
    pub memory_warn_bytes: u64,
    /// Hard memory cap; 90% of this triggers forced cleanup.
    pub memory_limit_bytes: u64,

    /// Period of the performance-monitor sampling loop.
    pub monitor_interval_ms: u64,
    /// Period of the routine resource-cleanup cycle.
    pub cleanup_interval_ms: u64,
    /// Idle connections older than this are closed by the cleanup cycle.
    pub idle_connection_timeout_ms: u64,

    /// Standard-deviation threshold for duration anomaly detection.
    pub anomaly_stddev_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            connection_timeout_ms: 5_000,
            query_timeout_ms: 5_000,
            statement_cache_size: 64,

            result_cache_ttl_ms: 300_000,
            result_cache_max_entries: 256,
            result_cache_max_value_bytes: 64 * 1024,

            buffer_flush_threshold: 50,
            buffer_flush_interval_ms: 1_000,
            max_concurrent_buffers: 100,

            max_batch_size: 20,
            high_priority_threshold: 8,
            min_batch_size: 5,
            backpressure_watermark: 0.8,
            max_retries: 3,

            memory_warn_bytes: 256 * 1024 * 1024,
            memory_limit_bytes: 512 * 1024 * 1024,

            monitor_interval_ms: 30_000,
            cleanup_interval_ms: 60_000,
            idle_connection_timeout_ms: 60_000,

            anomaly_stddev_threshold: 2.5,
        }
    }
}

impl EngineConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn buffer_flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.result_cache_ttl_ms)
    }

    /// Hard admission cap for the batch queue.
    pub fn queue_hard_cap(&self) -> usize {
        self.max_batch_size * 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_flush_threshold, 50);
        assert_eq!(config.max_concurrent_buffers, 100);
        assert_eq!(config.result_cache_ttl_ms, 300_000);
        assert_eq!(config.queue_hard_cap(), 200);
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"pool_size": 2}"#).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.buffer_flush_threshold, 50);
    }
}
