use regex::Regex;
use rusqlite::params;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracevault_types::{
    AuditContext, AuditOp, Error, Result, RuleType, ValidationRule, Violation,
};

use crate::resources::ResourceManager;
use crate::schema::fmt_ts;

/// Parsed rule configuration, compiled once at load time.
enum CompiledCheck {
    Required {
        allow_empty: bool,
    },
    Pattern(Regex),
    Range {
        min: Option<f64>,
        max: Option<f64>,
        exclusive_min: bool,
        exclusive_max: bool,
    },
    Enum {
        values: Vec<String>,
        case_insensitive: bool,
    },
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    /// Well-formed JSON only; schema-validation hook reserved.
    JsonSchema,
}

struct CompiledRule {
    rule: ValidationRule,
    check: CompiledCheck,
}

impl CompiledRule {
    fn compile(rule: ValidationRule) -> Result<Self> {
        let config: Value = serde_json::from_str(&rule.rule_config).unwrap_or(Value::Null);
        let check = match rule.rule_type {
            RuleType::Required => CompiledCheck::Required {
                allow_empty: config["allow_empty"].as_bool().unwrap_or(false),
            },
            RuleType::Pattern => {
                let pattern = config["pattern"].as_str().unwrap_or(".*");
                CompiledCheck::Pattern(Regex::new(pattern).map_err(|e| {
                    Error::Migration(format!(
                        "Invalid pattern rule for {}.{}: {}",
                        rule.table_name, rule.field_name, e
                    ))
                })?)
            }
            RuleType::Range => CompiledCheck::Range {
                min: config["min"].as_f64(),
                max: config["max"].as_f64(),
                exclusive_min: config["exclusive_min"].as_bool().unwrap_or(false),
                exclusive_max: config["exclusive_max"].as_bool().unwrap_or(false),
            },
            RuleType::Enum => CompiledCheck::Enum {
                values: config["values"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
                case_insensitive: config["case_insensitive"].as_bool().unwrap_or(false),
            },
            RuleType::Length => CompiledCheck::Length {
                min: config["min"].as_u64().map(|v| v as usize),
                max: config["max"].as_u64().map(|v| v as usize),
            },
            RuleType::JsonSchema => CompiledCheck::JsonSchema,
        };
        Ok(Self { rule, check })
    }

    fn violation(&self) -> Violation {
        Violation {
            table: self.rule.table_name.clone(),
            field: self.rule.field_name.clone(),
            rule_type: self.rule.rule_type.as_str().to_string(),
            message: self.rule.error_message.clone(),
        }
    }

    fn apply(&self, value: &Value) -> Option<Violation> {
        let ok = match &self.check {
            CompiledCheck::Required { allow_empty } => match value {
                Value::Null => false,
                Value::String(s) => *allow_empty || !s.is_empty(),
                _ => true,
            },
            CompiledCheck::Pattern(regex) => match value {
                Value::Null => true,
                Value::String(s) => regex.is_match(s),
                _ => false,
            },
            CompiledCheck::Range {
                min,
                max,
                exclusive_min,
                exclusive_max,
            } => match value.as_f64() {
                None => value.is_null(),
                Some(n) => {
                    let lo = min.map_or(true, |m| if *exclusive_min { n > m } else { n >= m });
                    let hi = max.map_or(true, |m| if *exclusive_max { n < m } else { n <= m });
                    lo && hi
                }
            },
            CompiledCheck::Enum {
                values,
                case_insensitive,
            } => match value {
                Value::Null => true,
                Value::String(s) => {
                    if *case_insensitive {
                        values.iter().any(|v| v.eq_ignore_ascii_case(s))
                    } else {
                        values.iter().any(|v| v == s)
                    }
                }
                _ => false,
            },
            CompiledCheck::Length { min, max } => match value {
                Value::Null => true,
                Value::String(s) => {
                    let len = s.chars().count();
                    min.map_or(true, |m| len >= m) && max.map_or(true, |m| len <= m)
                }
                _ => false,
            },
            CompiledCheck::JsonSchema => match value {
                Value::Null => true,
                Value::String(s) => serde_json::from_str::<Value>(s).is_ok(),
                // Already-structured values are well-formed by construction.
                _ => true,
            },
        };

        if ok {
            None
        } else {
            Some(self.violation())
        }
    }
}

/// Per-table foreign-key/orphan report from `validate_database_integrity`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IntegrityReport {
    pub foreign_key_violations: usize,
    /// (table, orphaned-row count) pairs, only tables with orphans.
    pub orphaned_records: Vec<(String, i64)>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.foreign_key_violations == 0 && self.orphaned_records.is_empty()
    }
}

/// Validation rules, audit logging, and database integrity checks.
///
/// Rules are loaded into an in-memory index keyed by `table.field` and
/// applied in ascending priority; every violation on a record is collected
/// before the validation error is raised.
pub struct IntegrityService {
    resources: Arc<ResourceManager>,
    rules: RwLock<HashMap<String, Vec<CompiledRule>>>,
}

impl IntegrityService {
    pub fn new(resources: Arc<ResourceManager>) -> Result<Self> {
        let service = Self {
            resources,
            rules: RwLock::new(HashMap::new()),
        };
        service.seed_default_rules()?;
        service.reload_rules()?;
        Ok(service)
    }

    /// Baseline rules for the fixed schema; idempotent via the unique
    /// (table, field, rule_type) constraint.
    fn seed_default_rules(&self) -> Result<()> {
        let defaults: &[(&str, &str, RuleType, &str, &str, i64)] = &[
            ("sessions", "id", RuleType::Required, "{}", "session id is required", 10),
            ("sessions", "agent_type", RuleType::Required, "{}", "agent type is required", 10),
            (
                "sessions",
                "status",
                RuleType::Enum,
                r#"{"values": ["active", "completed", "failed", "timeout"]}"#,
                "unknown session status",
                20,
            ),
            (
                "sessions",
                "metadata",
                RuleType::JsonSchema,
                "{}",
                "metadata must be well-formed JSON",
                30,
            ),
            ("events", "session_id", RuleType::Required, "{}", "event session id is required", 10),
            (
                "events",
                "event_type",
                RuleType::Enum,
                r#"{"values": ["start", "stream", "end", "error"]}"#,
                "unknown event type",
                20,
            ),
            (
                "events",
                "prompt",
                RuleType::Length,
                r#"{"max": 100000}"#,
                "prompt exceeds maximum length",
                30,
            ),
            (
                "errors",
                "severity",
                RuleType::Enum,
                r#"{"values": ["low", "medium", "high", "critical"]}"#,
                "unknown error severity",
                20,
            ),
        ];

        let conn = self.resources.acquire()?;
        for (table, field, rule_type, config, message, priority) in defaults {
            conn.prepare_cached(
                "INSERT OR IGNORE INTO validation_rules
                     (table_name, field_name, rule_type, rule_config, error_message,
                      active, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            )?
            .execute(params![table, field, rule_type.as_str(), config, message, priority])?;
        }
        Ok(())
    }

    /// Rebuild the in-memory rule index from the active rules on disk.
    pub fn reload_rules(&self) -> Result<()> {
        let conn = self.resources.acquire()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, table_name, field_name, rule_type, rule_config, error_message,
                    active, priority
             FROM validation_rules WHERE active = 1
             ORDER BY priority ASC, id ASC",
        )?;

        let rules = stmt
            .query_map([], |row| {
                let rule_type: String = row.get(3)?;
                Ok(ValidationRule {
                    id: row.get(0)?,
                    table_name: row.get(1)?,
                    field_name: row.get(2)?,
                    rule_type: rule_type.parse().unwrap_or(RuleType::Required),
                    rule_config: row.get(4)?,
                    error_message: row.get(5)?,
                    active: row.get::<_, i64>(6)? != 0,
                    priority: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut index: HashMap<String, Vec<CompiledRule>> = HashMap::new();
        for rule in rules {
            let key = format!("{}.{}", rule.table_name, rule.field_name);
            let compiled = CompiledRule::compile(rule)?;
            index.entry(key).or_default().push(compiled);
        }

        let mut guard = self
            .rules
            .write()
            .map_err(|_| Error::Connection("rule index lock poisoned".to_string()))?;
        *guard = index;
        Ok(())
    }

    /// Apply the active rules to every field present in `record`, collecting
    /// all violations before failing.
    pub fn validate(&self, table: &str, record: &Value) -> Result<()> {
        let Some(fields) = record.as_object() else {
            return Err(Error::Validation(vec![Violation {
                table: table.to_string(),
                field: "<record>".to_string(),
                rule_type: "shape".to_string(),
                message: "record must be a JSON object".to_string(),
            }]));
        };

        let guard = self
            .rules
            .read()
            .map_err(|_| Error::Connection("rule index lock poisoned".to_string()))?;

        let mut violations = Vec::new();
        for (field, value) in fields {
            let key = format!("{}.{}", table, field);
            if let Some(rules) = guard.get(&key) {
                // Index is already priority-sorted at load time.
                for compiled in rules {
                    if let Some(v) = compiled.apply(value) {
                        violations.push(v);
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(violations))
        }
    }

    /// Append one audit row for a mutation. The changed-field set is the
    /// structural difference between `old` and `new` top-level fields.
    /// Failures surface as `Error::Audit`; an unrecorded mutation is a
    /// data-integrity incident, not a soft failure.
    pub fn record_audit(
        &self,
        table: &str,
        record_id: &str,
        operation: AuditOp,
        old: Option<&Value>,
        new: Option<&Value>,
        context: &AuditContext,
    ) -> Result<i64> {
        let changed = changed_fields(old, new);
        let changed_json = serde_json::to_string(&changed)
            .map_err(|e| Error::Audit(format!("changed-field serialization: {}", e)))?;
        let old_json = old
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|e| Error::Audit(format!("old snapshot serialization: {}", e)))?;
        let new_json = new
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|e| Error::Audit(format!("new snapshot serialization: {}", e)))?;

        let conn = self
            .resources
            .acquire()
            .map_err(|e| Error::Audit(format!("no connection for audit write: {}", e)))?;
        conn.prepare_cached(
            "INSERT INTO audit_log (table_name, record_id, operation, old_value, new_value,
                                    changed_fields, actor, session_id, reason, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .map_err(|e| Error::Audit(e.to_string()))?
        .execute(params![
            table,
            record_id,
            operation.as_str(),
            old_json,
            new_json,
            changed_json,
            context.actor,
            context.session_id,
            context.reason,
            fmt_ts(chrono::Utc::now()),
        ])
        .map_err(|e| Error::Audit(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    /// Report foreign-key violations and orphaned-record counts. With FK
    /// enforcement on these should stay zero; the check exists to catch
    /// rows written before enforcement or by external tools.
    pub fn validate_database_integrity(&self) -> Result<IntegrityReport> {
        let conn = self.resources.acquire()?;

        let fk_violations: usize = {
            let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let rows = stmt.query_map([], |_row| Ok(()))?;
            rows.count()
        };

        let orphan_queries = [
            (
                "events",
                "SELECT COUNT(*) FROM events e
                 LEFT JOIN sessions s ON s.id = e.session_id WHERE s.id IS NULL",
            ),
            (
                "buffers",
                "SELECT COUNT(*) FROM buffers b
                 LEFT JOIN sessions s ON s.id = b.session_id WHERE s.id IS NULL",
            ),
            (
                "errors",
                "SELECT COUNT(*) FROM errors e
                 LEFT JOIN sessions s ON s.id = e.session_id
                 WHERE e.session_id IS NOT NULL AND s.id IS NULL",
            ),
        ];

        let mut orphaned_records = Vec::new();
        for (table, sql) in orphan_queries {
            let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            if count > 0 {
                orphaned_records.push((table.to_string(), count));
            }
        }

        Ok(IntegrityReport {
            foreign_key_violations: fk_violations,
            orphaned_records,
        })
    }
}

/// Union of top-level field names whose values differ structurally.
fn changed_fields(old: Option<&Value>, new: Option<&Value>) -> Vec<String> {
    let empty = serde_json::Map::new();
    let old_map = old.and_then(|v| v.as_object()).unwrap_or(&empty);
    let new_map = new.and_then(|v| v.as_object()).unwrap_or(&empty);

    let mut names: BTreeSet<&String> = old_map.keys().collect();
    names.extend(new_map.keys());

    names
        .into_iter()
        .filter(|name| old_map.get(*name) != new_map.get(*name))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracevault_types::EngineConfig;

    fn service() -> IntegrityService {
        let resources = ResourceManager::open_in_memory(EngineConfig::default()).unwrap();
        IntegrityService::new(resources).unwrap()
    }

    #[test]
    fn test_validate_passes_clean_session() {
        let svc = service();
        let record = json!({
            "id": "s1",
            "agent_type": "claude",
            "status": "active",
            "metadata": r#"{"k": 1}"#,
        });
        svc.validate("sessions", &record).unwrap();
    }

    #[test]
    fn test_validate_collects_all_violations() {
        let svc = service();
        let record = json!({
            "id": "",
            "status": "bogus",
            "metadata": "{not json",
        });

        let err = svc.validate("sessions", &record).unwrap_err();
        match err {
            Error::Validation(violations) => {
                assert_eq!(violations.len(), 3);
                let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
                assert!(fields.contains(&"id"));
                assert!(fields.contains(&"status"));
                assert!(fields.contains(&"metadata"));
            }
            other => panic!("expected validation error, got {}", other),
        }
    }

    #[test]
    fn test_validate_ignores_unknown_fields() {
        let svc = service();
        let record = json!({"some_future_field": 42});
        svc.validate("sessions", &record).unwrap();
    }

    #[test]
    fn test_enum_rule_case_sensitivity() {
        let svc = service();
        // Seeded status enum is case-sensitive.
        let record = json!({"status": "ACTIVE"});
        assert!(svc.validate("sessions", &record).is_err());
    }

    #[test]
    fn test_length_rule_on_prompt() {
        let svc = service();
        let record = json!({"prompt": "x".repeat(100_001)});
        assert!(svc.validate("events", &record).is_err());
        let record = json!({"prompt": "short"});
        svc.validate("events", &record).unwrap();
    }

    #[test]
    fn test_record_audit_computes_changed_fields() {
        let svc = service();
        let old = json!({"status": "active", "event_count": 1});
        let new = json!({"status": "completed", "event_count": 1});

        let id = svc
            .record_audit(
                "sessions",
                "s1",
                AuditOp::Update,
                Some(&old),
                Some(&new),
                &AuditContext {
                    actor: Some("engine".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(id > 0);

        let conn = svc.resources.acquire().unwrap();
        let changed: String = conn
            .query_row(
                "SELECT changed_fields FROM audit_log WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(changed, r#"["status"]"#);
    }

    #[test]
    fn test_audit_rows_append_only() {
        let svc = service();
        let old = json!({"a": 1});
        let new = json!({"a": 2});
        svc.record_audit("sessions", "s1", AuditOp::Update, Some(&old), Some(&new), &AuditContext::default())
            .unwrap();
        svc.record_audit("sessions", "s1", AuditOp::Delete, Some(&new), None, &AuditContext::default())
            .unwrap();

        let conn = svc.resources.acquire().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_integrity_report_clean_database() {
        let svc = service();
        let report = svc.validate_database_integrity().unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_changed_fields_insert_and_delete() {
        let new = json!({"a": 1, "b": 2});
        assert_eq!(changed_fields(None, Some(&new)), vec!["a", "b"]);
        assert_eq!(changed_fields(Some(&new), None), vec!["a", "b"]);
        assert!(changed_fields(Some(&new), Some(&new)).is_empty());
    }
}
