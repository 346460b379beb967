use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{EventType, SessionStatus};

/// Result ordering by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter for session queries. Empty vectors mean "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<SessionStatus>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

/// Filter for event queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modes: Vec<String>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl SessionFilter {
    /// Filter matching a set of agent types, everything else unconstrained.
    pub fn for_agents<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_types: agents.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

impl EventFilter {
    /// Filter matching a single session, ascending by time.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_ids: vec![session_id.into()],
            order: SortOrder::Asc,
            ..Default::default()
        }
    }
}

/// Filter applied to bulk export. Shares semantics with the query filters
/// but applies a single time range / id set across every exported table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modes: Vec<String>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl ExportFilter {
    pub fn to_session_filter(&self) -> SessionFilter {
        SessionFilter {
            from: self.from,
            to: self.to,
            session_ids: self.session_ids.clone(),
            agent_types: self.agent_types.clone(),
            modes: self.modes.clone(),
            statuses: Vec::new(),
            order: self.order,
            limit: self.limit,
            offset: self.offset,
        }
    }

    pub fn to_event_filter(&self) -> EventFilter {
        EventFilter {
            from: self.from,
            to: self.to,
            session_ids: self.session_ids.clone(),
            event_types: Vec::new(),
            agent_types: self.agent_types.clone(),
            modes: self.modes.clone(),
            order: self.order,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_is_unconstrained() {
        let filter = SessionFilter::default();
        assert!(filter.from.is_none());
        assert!(filter.agent_types.is_empty());
        assert_eq!(filter.order, SortOrder::Desc);
    }

    #[test]
    fn test_export_filter_projection() {
        let filter = ExportFilter {
            agent_types: vec!["claude".to_string()],
            ..Default::default()
        };
        assert_eq!(filter.to_session_filter().agent_types, vec!["claude"]);
        assert_eq!(filter.to_event_filter().agent_types, vec!["claude"]);
    }
}
