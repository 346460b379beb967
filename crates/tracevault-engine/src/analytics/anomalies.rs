use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use tracevault_types::{ErrorSeverity, EventRecord, EventType, SessionRecord};

use super::percentiles::mean_stddev;

/// Assumed steady-state error rate; an error spike is a 5-minute window
/// exceeding three times this.
pub const ERROR_RATE_BASELINE: f64 = 0.05;
const ERROR_SPIKE_FACTOR: f64 = 3.0;
const DROP_FRACTION: f64 = 0.3;
const AGENT_DOMINANCE_SHARE: f64 = 0.9;
/// Minimum historical sessions before the duration detector engages.
const BASELINE_MIN_SESSIONS: usize = 10;
/// Minimum sessions in range before the dominance detector engages.
const DOMINANCE_MIN_SESSIONS: usize = 10;
/// The configured stddev threshold is capped here at detection time, so
/// the 2.5 default behaves as 2.0 while explicit lower settings hold.
const EFFECTIVE_THRESHOLD_CAP: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    DurationSpike,
    ErrorSpike,
    SessionDrop,
    UnusualPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// When the anomalous session or window occurred.
    pub at: DateTime<Utc>,
    /// Distance from baseline in standard deviations, where applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation_score: Option<f64>,
    pub details: String,
}

/// Flag in-range sessions whose duration deviates from the historical
/// baseline by more than the (capped) threshold in standard deviations.
pub fn detect_duration_spikes(
    sessions: &[SessionRecord],
    baseline_durations_ms: &[f64],
    configured_threshold: f64,
) -> Vec<Anomaly> {
    if baseline_durations_ms.len() < BASELINE_MIN_SESSIONS {
        return Vec::new();
    }
    let (mean, stddev) = mean_stddev(baseline_durations_ms);
    if stddev <= f64::EPSILON {
        return Vec::new();
    }

    let threshold = configured_threshold.min(EFFECTIVE_THRESHOLD_CAP);
    let mut anomalies = Vec::new();
    for session in sessions {
        let Some(duration) = session.duration_ms else {
            continue;
        };
        let score = (duration as f64 - mean).abs() / stddev;
        if score > threshold {
            anomalies.push(Anomaly {
                kind: AnomalyKind::DurationSpike,
                severity: spike_severity(score, threshold),
                session_id: Some(session.id.clone()),
                at: session.start_time,
                deviation_score: Some(score),
                details: format!(
                    "session duration {}ms deviates {:.1} stddev from baseline mean {:.0}ms",
                    duration, score, mean
                ),
            });
        }
    }
    anomalies
}

fn spike_severity(score: f64, threshold: f64) -> ErrorSeverity {
    if score > threshold * 4.0 {
        ErrorSeverity::Critical
    } else if score > threshold * 2.0 {
        ErrorSeverity::High
    } else {
        ErrorSeverity::Medium
    }
}

/// Flag 5-minute windows whose event error rate exceeds 3x the baseline.
pub fn detect_error_spikes(
    events: &[EventRecord],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<Anomaly> {
    let window = ChronoDuration::minutes(5);
    let mut anomalies = Vec::new();

    let mut start = from;
    while start < to {
        let end = start + window;
        let in_window: Vec<&EventRecord> = events
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp < end)
            .collect();
        if !in_window.is_empty() {
            let errors = in_window
                .iter()
                .filter(|e| e.event_type == EventType::Error)
                .count();
            let rate = errors as f64 / in_window.len() as f64;
            if rate > ERROR_RATE_BASELINE * ERROR_SPIKE_FACTOR {
                let severity = if rate > ERROR_RATE_BASELINE * 10.0 {
                    ErrorSeverity::Critical
                } else if rate > ERROR_RATE_BASELINE * 6.0 {
                    ErrorSeverity::High
                } else {
                    ErrorSeverity::Medium
                };
                anomalies.push(Anomaly {
                    kind: AnomalyKind::ErrorSpike,
                    severity,
                    session_id: None,
                    at: start,
                    deviation_score: Some(rate / ERROR_RATE_BASELINE),
                    details: format!(
                        "error rate {:.1}% over {} events in 5m window",
                        rate * 100.0,
                        in_window.len()
                    ),
                });
            }
        }
        start = end;
    }
    anomalies
}

/// Flag 10-minute windows whose session count drops below 30% of the
/// moving average of the previous two windows.
pub fn detect_session_drops(
    sessions: &[SessionRecord],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<Anomaly> {
    let window = ChronoDuration::minutes(10);
    let mut counts = Vec::new();
    let mut starts = Vec::new();

    let mut start = from;
    while start < to {
        let end = start + window;
        let count = sessions
            .iter()
            .filter(|s| s.start_time >= start && s.start_time < end)
            .count();
        counts.push(count as f64);
        starts.push(start);
        start = end;
    }

    let mut anomalies = Vec::new();
    for i in 2..counts.len() {
        let moving_avg = (counts[i - 2] + counts[i - 1]) / 2.0;
        if moving_avg >= 2.0 && counts[i] < moving_avg * DROP_FRACTION {
            let severity = if counts[i] < moving_avg * 0.1 {
                ErrorSeverity::High
            } else {
                ErrorSeverity::Medium
            };
            anomalies.push(Anomaly {
                kind: AnomalyKind::SessionDrop,
                severity,
                session_id: None,
                at: starts[i],
                deviation_score: Some(1.0 - counts[i] / moving_avg),
                details: format!(
                    "{} sessions in 10m window, recent average {:.1}",
                    counts[i] as usize, moving_avg
                ),
            });
        }
    }
    anomalies
}

/// Flag an agent type accounting for over 90% of sessions in the range.
pub fn detect_unusual_patterns(sessions: &[SessionRecord], at: DateTime<Utc>) -> Vec<Anomaly> {
    if sessions.len() < DOMINANCE_MIN_SESSIONS {
        return Vec::new();
    }

    let mut by_agent: HashMap<&str, usize> = HashMap::new();
    for session in sessions {
        *by_agent.entry(session.agent_type.as_str()).or_default() += 1;
    }

    let mut anomalies = Vec::new();
    for (agent, count) in by_agent {
        let share = count as f64 / sessions.len() as f64;
        if share > AGENT_DOMINANCE_SHARE {
            anomalies.push(Anomaly {
                kind: AnomalyKind::UnusualPattern,
                severity: if share > 0.98 {
                    ErrorSeverity::Medium
                } else {
                    ErrorSeverity::Low
                },
                session_id: None,
                at,
                deviation_score: Some(share),
                details: format!(
                    "agent '{}' accounts for {:.0}% of {} sessions",
                    agent,
                    share * 100.0,
                    sessions.len()
                ),
            });
        }
    }
    anomalies
}

/// Severity first (critical > high > medium > low), then recency.
pub fn rank(mut anomalies: Vec<Anomaly>) -> Vec<Anomaly> {
    anomalies.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.at.cmp(&a.at)));
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tracevault_types::SessionStatus;

    fn session(id: &str, agent: &str, minute: u32, duration_ms: Option<i64>) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            agent_type: agent.to_string(),
            mode: "code".to_string(),
            status: SessionStatus::Completed,
            start_time: Utc.with_ymd_and_hms(2026, 1, 1, 10, minute, 0).unwrap(),
            end_time: None,
            duration_ms,
            event_count: 0,
            stream_event_count: 0,
            error_count: 0,
            sandbox_id: None,
            repo_url: None,
            metadata: None,
            version: 1,
            schema_version: "1.0".to_string(),
        }
    }

    #[test]
    fn test_duration_spike_scores_in_stddevs() {
        let baseline: Vec<f64> = (0..50)
            .map(|i| if i % 2 == 0 { 900.0 } else { 1100.0 })
            .collect();
        let sessions = vec![
            session("normal", "claude", 0, Some(1_050)),
            session("spike", "claude", 1, Some(9_000)),
        ];

        let anomalies = detect_duration_spikes(&sessions, &baseline, 2.5);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].session_id.as_deref(), Some("spike"));
        let score = anomalies[0].deviation_score.unwrap();
        assert!((score - 80.0).abs() < 0.01);
        assert_eq!(anomalies[0].severity, ErrorSeverity::Critical);
    }

    #[test]
    fn test_duration_detector_needs_baseline() {
        let sessions = vec![session("s", "claude", 0, Some(9_000))];
        assert!(detect_duration_spikes(&sessions, &[1000.0; 5], 2.5).is_empty());
    }

    #[test]
    fn test_dominant_agent_flagged() {
        let mut sessions: Vec<SessionRecord> = (0..19)
            .map(|i| session(&format!("c{}", i), "claude", 0, None))
            .collect();
        sessions.push(session("x", "codex", 0, None));

        let anomalies = detect_unusual_patterns(&sessions, Utc::now());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::UnusualPattern);

        // 80/20 split is fine.
        let mut balanced: Vec<SessionRecord> = (0..16)
            .map(|i| session(&format!("c{}", i), "claude", 0, None))
            .collect();
        balanced.extend((0..4).map(|i| session(&format!("x{}", i), "codex", 0, None)));
        assert!(detect_unusual_patterns(&balanced, Utc::now()).is_empty());
    }

    #[test]
    fn test_session_drop_against_moving_average() {
        // Windows: 10, 10, 1 -> third is below 30% of avg(10, 10).
        let mut sessions = Vec::new();
        for i in 0..10 {
            sessions.push(session(&format!("a{}", i), "claude", 0, None));
            sessions.push(session(&format!("b{}", i), "claude", 10, None));
        }
        sessions.push(session("c", "claude", 20, None));

        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 0).unwrap();
        let anomalies = detect_session_drops(&sessions, from, to);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::SessionDrop);
    }

    #[test]
    fn test_rank_orders_severity_then_recency() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap();
        let make = |severity, at| Anomaly {
            kind: AnomalyKind::ErrorSpike,
            severity,
            session_id: None,
            at,
            deviation_score: None,
            details: String::new(),
        };

        let ranked = rank(vec![
            make(ErrorSeverity::Medium, late),
            make(ErrorSeverity::Critical, early),
            make(ErrorSeverity::Medium, early),
        ]);
        assert_eq!(ranked[0].severity, ErrorSeverity::Critical);
        assert_eq!(ranked[1].at, late);
        assert_eq!(ranked[2].at, early);
    }
}
