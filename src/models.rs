//! Domain entities and enums shared across intake, grouping, retrieval and
//! the HTTP surface.
//!
//! Enum columns are stored as TEXT; the `sqlx::Type` derives map them through
//! their string representation. Structured columns (payloads, embeddings,
//! citations) are JSONB and decoded through `sqlx::types::Json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;

/// Alert and incident severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Incident lifecycle status. Transitions follow a strict forward-only chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolved,
    Closed,
}

impl IncidentStatus {
    /// Allowed transitions: open → investigating → resolved → closed.
    /// No skips, no reversals, no self-loops.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        matches!(
            (self, next),
            (IncidentStatus::Open, IncidentStatus::Investigating)
                | (IncidentStatus::Investigating, IncidentStatus::Resolved)
                | (IncidentStatus::Resolved, IncidentStatus::Closed)
        )
    }

    /// Statuses considered live for grouping and dashboard counters.
    pub fn is_active(self) -> bool {
        matches!(self, IncidentStatus::Open | IncidentStatus::Investigating)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Audit trail action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ActionType {
    StatusChange,
    Comment,
    AlertAdded,
    AlertRemoved,
    Assignment,
    Escalation,
}

/// Integration connector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConnectorStatus {
    NotConnected,
    Connected,
}

/// A single observation from an external monitoring source.
///
/// Immutable after intake except for the one-shot enrichment pass performed
/// by the worker (classification, entities, incident link).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub message: Option<String>,
    #[serde(skip_serializing)]
    pub raw_payload: Json<serde_json::Value>,
    pub alert_timestamp: DateTime<Utc>,
    pub severity: Option<Severity>,
    pub predicted_team: Option<String>,
    pub confidence_score: Option<f64>,
    pub classification_source: Option<String>,
    pub service_name: Option<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub error_code: Option<String>,
    pub entity_source: Option<String>,
    pub entity_sources: Option<Json<serde_json::Map<String, serde_json::Value>>>,
    pub incident_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An aggregation of related alerts with a lifecycle and audit trail.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Incident {
    pub id: i64,
    pub title: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub assigned_team: Option<String>,
    pub assigned_user: Option<String>,
    pub summary: Option<String>,
    pub summary_citations: Option<Json<Vec<Citation>>>,
    pub next_steps: Option<Json<Vec<String>>>,
    pub affected_services: Json<Vec<String>>,
    #[serde(skip_serializing)]
    pub incident_embedding: Option<Json<Vec<f32>>>,
    pub time_to_acknowledge: Option<i64>,
    pub time_to_resolve: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Column list matching the `FromRow` field order, for explicit SELECTs.
    pub const COLUMNS: &'static str = "id, title, severity, status, assigned_team, \
        assigned_user, summary, summary_citations, next_steps, affected_services, \
        incident_embedding, time_to_acknowledge, time_to_resolve, created_at, \
        updated_at, resolved_at, closed_at";

    pub fn services(&self) -> &[String] {
        &self.affected_services.0
    }
}

impl Alert {
    pub const COLUMNS: &'static str = "id, external_id, source, title, message, \
        raw_payload, alert_timestamp, severity, predicted_team, confidence_score, \
        classification_source, service_name, environment, region, error_code, \
        entity_source, entity_sources, incident_id, created_at, updated_at";
}

impl IncidentAction {
    pub const COLUMNS: &'static str =
        "id, incident_id, action_type, description, actor, extra_metadata, timestamp";
}

impl RunbookChunk {
    pub const COLUMNS: &'static str = "id, source, source_uri, source_document, \
        chunk_index, title, content, embedding, doc_metadata, created_at, updated_at";
}

/// Append-only audit record on an incident. Never updated, never deleted
/// except via incident cascade.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IncidentAction {
    pub id: i64,
    pub incident_id: i64,
    pub action_type: ActionType,
    pub description: String,
    #[sqlx(rename = "actor")]
    pub user: Option<String>,
    pub extra_metadata: Option<Json<serde_json::Value>>,
    pub timestamp: DateTime<Utc>,
}

/// A retrievable passage of operational documentation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunbookChunk {
    pub id: i64,
    pub source: String,
    pub source_uri: Option<String>,
    pub source_document: String,
    pub chunk_index: i32,
    pub title: Option<String>,
    pub content: String,
    #[serde(skip_serializing)]
    pub embedding: Option<Json<Vec<f32>>>,
    pub doc_metadata: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An integration connector record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Connector {
    pub id: String,
    pub name: String,
    pub status: ConnectorStatus,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A tagged reference used in incident summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Citation {
    Incident {
        id: i64,
        title: String,
        score: f64,
    },
    Alert {
        id: i64,
        title: String,
    },
    Runbook {
        source_document: String,
        chunk_index: i32,
        title: Option<String>,
        score: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_allows_only_forward_steps() {
        use IncidentStatus::*;

        let all = [Open, Investigating, Resolved, Closed];
        let allowed = [(Open, Investigating), (Investigating, Resolved), (Resolved, Closed)];

        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "transition {:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn status_dag_rejects_self_loops() {
        for status in [
            IncidentStatus::Open,
            IncidentStatus::Investigating,
            IncidentStatus::Resolved,
            IncidentStatus::Closed,
        ] {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn citation_serializes_with_type_tag() {
        let citation = Citation::Runbook {
            source_document: "db-failover.md".to_string(),
            chunk_index: 2,
            title: Some("Database failover".to_string()),
            score: 0.42,
        };

        let value = serde_json::to_value(&citation).unwrap();
        assert_eq!(value["type"], "runbook");
        assert_eq!(value["source_document"], "db-failover.md");
        assert_eq!(value["chunk_index"], 2);

        let alert = serde_json::to_value(Citation::Alert {
            id: 7,
            title: "High CPU".to_string(),
        })
        .unwrap();
        assert_eq!(alert["type"], "alert");
        assert!(alert.get("score").is_none());
    }

    #[test]
    fn citation_round_trips_through_json() {
        let original = Citation::Incident {
            id: 11,
            title: "Checkout latency".to_string(),
            score: 0.913,
        };
        let text = serde_json::to_string(&original).unwrap();
        let back: Citation = serde_json::from_str(&text).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn severity_display_matches_wire_format() {
        assert_eq!(Severity::Critical.to_string(), "critical");
        assert_eq!(IncidentStatus::Investigating.to_string(), "investigating");
    }
}
