use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use tracevault_store::ResourceManager;
use tracevault_types::ErrorSeverity;

/// Samples older than this fall out of the trend history.
const HISTORY_WINDOW: Duration = Duration::from_secs(3600);

/// Resolved alerts are pruned after an hour.
const RESOLVED_RETENTION: Duration = Duration::from_secs(3600);

/// An alert resolves once its metric drops below this fraction of the
/// threshold, giving flapping metrics some hysteresis.
const RESOLVE_FRACTION: f64 = 0.9;

/// Metrics the monitor tracks. All are "higher is worse".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    MemoryUsedBytes,
    PoolUtilization,
    CacheMissRate,
    AvgStatementLatencyMs,
    QueueOccupancy,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::MemoryUsedBytes => "memory_used_bytes",
            Metric::PoolUtilization => "pool_utilization",
            Metric::CacheMissRate => "cache_miss_rate",
            Metric::AvgStatementLatencyMs => "avg_statement_latency_ms",
            Metric::QueueOccupancy => "queue_occupancy",
        }
    }
}

/// Alert thresholds per tracked metric.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub memory_used_bytes: f64,
    pub pool_utilization: f64,
    pub cache_miss_rate: f64,
    pub avg_statement_latency_ms: f64,
    pub queue_occupancy: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_used_bytes: 256.0 * 1024.0 * 1024.0,
            pool_utilization: 0.9,
            cache_miss_rate: 0.8,
            avg_statement_latency_ms: 250.0,
            queue_occupancy: 0.8,
        }
    }
}

impl Thresholds {
    fn for_metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::MemoryUsedBytes => self.memory_used_bytes,
            Metric::PoolUtilization => self.pool_utilization,
            Metric::CacheMissRate => self.cache_miss_rate,
            Metric::AvgStatementLatencyMs => self.avg_statement_latency_ms,
            Metric::QueueOccupancy => self.queue_occupancy,
        }
    }
}

/// One active or recently-resolved alert. Repeated crossings of the same
/// metric update this record in place rather than raising a new one.
#[derive(Debug, Clone)]
pub struct Alert {
    pub metric: Metric,
    pub severity: ErrorSeverity,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: Instant,
    pub last_seen: Instant,
    pub resolved_at: Option<Instant>,
}

/// Least-squares fit over a metric's history, projected one hour ahead.
#[derive(Debug, Clone)]
pub struct TrendPrediction {
    pub metric: Metric,
    pub slope_per_sec: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub current: f64,
    pub projected_1h: f64,
    /// Seconds until the metric crosses its threshold at the current
    /// slope; None when the trend is flat, falling, or already past it.
    pub secs_to_threshold: Option<f64>,
}

struct Sample {
    at: Instant,
    value: f64,
}

struct State {
    history: HashMap<Metric, VecDeque<Sample>>,
    alerts: HashMap<Metric, Alert>,
}

/// Cross-cutting performance watcher: snapshots resource metrics on a
/// timer, raises/coalesces/resolves threshold alerts, and fits linear
/// trends over a bounded history.
pub struct PerformanceMonitor {
    resources: Arc<ResourceManager>,
    thresholds: Thresholds,
    auto_tune: bool,
    state: Mutex<State>,
}

impl PerformanceMonitor {
    pub fn new(resources: Arc<ResourceManager>, thresholds: Thresholds, auto_tune: bool) -> Self {
        Self {
            resources,
            thresholds,
            auto_tune,
            state: Mutex::new(State {
                history: HashMap::new(),
                alerts: HashMap::new(),
            }),
        }
    }

    /// One monitoring tick. `queue_occupancy` comes from the batch queue,
    /// which the resource manager does not see.
    pub fn sample(&self, queue_occupancy: f64) {
        let metrics = self.resources.metrics();
        let cache_miss_rate = 1.0 - metrics.cache.hit_rate();

        self.observe(Metric::MemoryUsedBytes, metrics.memory_used_bytes as f64);
        self.observe(Metric::PoolUtilization, metrics.pool_utilization);
        self.observe(Metric::CacheMissRate, cache_miss_rate);
        self.observe(
            Metric::AvgStatementLatencyMs,
            metrics.avg_statement_latency_ms,
        );
        self.observe(Metric::QueueOccupancy, queue_occupancy);
    }

    /// Record one value for one metric, updating history and the alert
    /// table. Exposed for tests; production callers go through `sample`.
    pub fn observe(&self, metric: Metric, value: f64) {
        let now = Instant::now();
        let threshold = self.thresholds.for_metric(metric);
        let mut critical = false;

        {
            let mut state = self.lock();

            let series = state.history.entry(metric).or_default();
            series.push_back(Sample { at: now, value });
            while series
                .front()
                .is_some_and(|s| now.duration_since(s.at) > HISTORY_WINDOW)
            {
                series.pop_front();
            }

            if value >= threshold {
                let severity = severity_for(value, threshold);
                critical = severity == ErrorSeverity::Critical;
                match state.alerts.get_mut(&metric) {
                    Some(alert) if alert.resolved_at.is_none() => {
                        alert.value = value;
                        alert.severity = alert.severity.max(severity);
                        alert.last_seen = now;
                    }
                    _ => {
                        warn!(
                            metric = metric.as_str(),
                            value,
                            threshold,
                            severity = severity.as_str(),
                            "performance threshold crossed"
                        );
                        state.alerts.insert(
                            metric,
                            Alert {
                                metric,
                                severity,
                                value,
                                threshold,
                                raised_at: now,
                                last_seen: now,
                                resolved_at: None,
                            },
                        );
                    }
                }
            } else if value < threshold * RESOLVE_FRACTION {
                if let Some(alert) = state.alerts.get_mut(&metric) {
                    if alert.resolved_at.is_none() {
                        info!(metric = metric.as_str(), value, "alert resolved");
                        alert.resolved_at = Some(now);
                    }
                }
            }

            state
                .alerts
                .retain(|_, a| match a.resolved_at {
                    Some(at) => now.duration_since(at) < RESOLVED_RETENTION,
                    None => true,
                });
        }

        if critical && self.auto_tune {
            self.apply_tuning(metric);
        }
    }

    /// Critical-alert tuning actions: cheap, idempotent resource relief.
    fn apply_tuning(&self, metric: Metric) {
        match metric {
            Metric::MemoryUsedBytes | Metric::PoolUtilization => {
                info!(metric = metric.as_str(), "auto-tuning: forced resource cleanup");
                self.resources.forced_cleanup();
            }
            Metric::CacheMissRate => {
                info!(metric = metric.as_str(), "auto-tuning: dropping stale result cache");
                self.resources.result_cache().evict_expired();
            }
            Metric::AvgStatementLatencyMs | Metric::QueueOccupancy => {}
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.lock()
            .alerts
            .values()
            .filter(|a| a.resolved_at.is_none())
            .cloned()
            .collect()
    }

    pub fn alert_for(&self, metric: Metric) -> Option<Alert> {
        self.lock().alerts.get(&metric).cloned()
    }

    /// Fit a linear trend per metric with at least three samples.
    pub fn trends(&self) -> Vec<TrendPrediction> {
        let state = self.lock();
        let now = Instant::now();

        state
            .history
            .iter()
            .filter(|(_, series)| series.len() >= 3)
            .map(|(metric, series)| {
                let points: Vec<(f64, f64)> = series
                    .iter()
                    .map(|s| (-(now.duration_since(s.at).as_secs_f64()), s.value))
                    .collect();
                let (slope, intercept, r_squared) = linear_regression(&points);
                let current = intercept;
                let projected_1h = slope * 3600.0 + intercept;

                let threshold = self.thresholds.for_metric(*metric);
                let secs_to_threshold = if slope > f64::EPSILON && current < threshold {
                    Some((threshold - current) / slope)
                } else {
                    None
                };

                TrendPrediction {
                    metric: *metric,
                    slope_per_sec: slope,
                    intercept,
                    r_squared,
                    current,
                    projected_1h,
                    secs_to_threshold,
                }
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Severity scales with how far past the threshold the value sits.
fn severity_for(value: f64, threshold: f64) -> ErrorSeverity {
    let ratio = if threshold.abs() > f64::EPSILON {
        value / threshold
    } else {
        f64::INFINITY
    };
    if ratio >= 2.0 {
        ErrorSeverity::Critical
    } else if ratio >= 1.5 {
        ErrorSeverity::High
    } else if ratio >= 1.2 {
        ErrorSeverity::Medium
    } else {
        ErrorSeverity::Low
    }
}

/// Ordinary least squares over (x, y) points. Returns (slope, intercept,
/// r_squared); a vertical or degenerate series fits as flat.
fn linear_regression(points: &[(f64, f64)]) -> (f64, f64, f64) {
    let n = points.len() as f64;
    if points.len() < 2 {
        return (0.0, points.first().map_or(0.0, |p| p.1), 0.0);
    }

    let mean_x: f64 = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y: f64 = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut ss_xy = 0.0;
    let mut ss_xx = 0.0;
    let mut ss_yy = 0.0;
    for (x, y) in points {
        ss_xy += (x - mean_x) * (y - mean_y);
        ss_xx += (x - mean_x) * (x - mean_x);
        ss_yy += (y - mean_y) * (y - mean_y);
    }

    if ss_xx.abs() < f64::EPSILON {
        return (0.0, mean_y, 0.0);
    }

    let slope = ss_xy / ss_xx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if ss_yy.abs() < f64::EPSILON {
        1.0
    } else {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    };
    (slope, intercept, r_squared)
}
