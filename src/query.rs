//! Query helpers for incident and alert listings.
//!
//! Centralizes filtering and pagination so the handlers stay thin. Filters
//! that depend on the alerts table use EXISTS subqueries so they compose
//! with the aggregates join.

use crate::error::Result;
use crate::models::{Alert, Incident, IncidentStatus, Severity};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 200;

/// Clamp a requested page size into [1, 200], defaulting to 50.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    match limit {
        None => DEFAULT_LIMIT,
        Some(n) => n.clamp(1, MAX_LIMIT),
    }
}

/// Incident list filters, matching the query-string surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub severity: Option<Severity>,
    pub service: Option<String>,
    pub team: Option<String>,
    pub source: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub updated_from: Option<DateTime<Utc>>,
    pub updated_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Alert list filters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    pub source: Option<String>,
    pub severity: Option<Severity>,
    pub service: Option<String>,
    pub environment: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub incident_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// An incident with its per-item alert aggregates.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct IncidentWithStats {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub incident: Incident,
    pub alert_count: Option<i64>,
    pub last_alert_at: Option<DateTime<Utc>>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn push_incident_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &IncidentFilter) {
    if let Some(status) = filter.status {
        qb.push(" AND incidents.status = ").push_bind(status);
    }
    if let Some(severity) = filter.severity {
        qb.push(" AND incidents.severity = ").push_bind(severity);
    }
    if let Some(team) = non_empty(&filter.team) {
        qb.push(" AND incidents.assigned_team = ")
            .push_bind(team.to_string());
    }
    if let Some(created_from) = filter.created_from {
        qb.push(" AND incidents.created_at >= ").push_bind(created_from);
    }
    if let Some(created_to) = filter.created_to {
        qb.push(" AND incidents.created_at <= ").push_bind(created_to);
    }
    if let Some(updated_from) = filter.updated_from {
        qb.push(" AND incidents.updated_at >= ").push_bind(updated_from);
    }
    if let Some(updated_to) = filter.updated_to {
        qb.push(" AND incidents.updated_at <= ").push_bind(updated_to);
    }
    if let Some(source) = non_empty(&filter.source) {
        qb.push(
            " AND EXISTS (SELECT 1 FROM alerts \
             WHERE alerts.incident_id = incidents.id AND alerts.source = ",
        )
        .push_bind(source.to_string())
        .push(")");
    }
    if let Some(service) = non_empty(&filter.service) {
        qb.push(" AND (incidents.affected_services @> ")
            .push_bind(Json(vec![service.to_string()]))
            .push(
                " OR EXISTS (SELECT 1 FROM alerts \
                 WHERE alerts.incident_id = incidents.id AND alerts.service_name = ",
            )
            .push_bind(service.to_string())
            .push("))");
    }
}

fn push_alert_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &AlertFilter) {
    if let Some(source) = non_empty(&filter.source) {
        qb.push(" AND alerts.source = ").push_bind(source.to_string());
    }
    if let Some(severity) = filter.severity {
        qb.push(" AND alerts.severity = ").push_bind(severity);
    }
    if let Some(service) = non_empty(&filter.service) {
        qb.push(" AND alerts.service_name = ")
            .push_bind(service.to_string());
    }
    if let Some(environment) = non_empty(&filter.environment) {
        qb.push(" AND alerts.environment = ")
            .push_bind(environment.to_string());
    }
    if let Some(incident_id) = filter.incident_id {
        qb.push(" AND alerts.incident_id = ").push_bind(incident_id);
    }
    if let Some(created_from) = filter.created_from {
        qb.push(" AND alerts.created_at >= ").push_bind(created_from);
    }
    if let Some(created_to) = filter.created_to {
        qb.push(" AND alerts.created_at <= ").push_bind(created_to);
    }
}

const INCIDENT_AGGREGATES_JOIN: &str = " LEFT JOIN (SELECT incident_id, COUNT(*) AS alert_count, \
     MAX(alert_timestamp) AS last_alert_at \
     FROM alerts GROUP BY incident_id) agg ON agg.incident_id = incidents.id";

/// List incidents matching the filter, newest first, with aggregates and a
/// total count. Returns `(items, total, limit, offset)`.
pub async fn list_incidents(
    pool: &PgPool,
    filter: &IncidentFilter,
) -> Result<(Vec<IncidentWithStats>, i64, i64, i64)> {
    let limit = clamp_limit(filter.limit);
    let offset = filter.offset.unwrap_or(0).max(0);

    let mut count_qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM incidents WHERE 1=1");
    push_incident_filters(&mut count_qb, filter);
    let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "SELECT incidents.*, agg.alert_count, agg.last_alert_at FROM incidents",
    );
    qb.push(INCIDENT_AGGREGATES_JOIN);
    qb.push(" WHERE 1=1");
    push_incident_filters(&mut qb, filter);
    qb.push(" ORDER BY incidents.created_at DESC OFFSET ")
        .push_bind(offset)
        .push(" LIMIT ")
        .push_bind(limit);

    let items = qb
        .build_query_as::<IncidentWithStats>()
        .fetch_all(pool)
        .await?;

    Ok((items, total, limit, offset))
}

/// Fetch one incident with its aggregates.
pub async fn get_incident_with_stats(
    pool: &PgPool,
    incident_id: i64,
) -> Result<Option<IncidentWithStats>> {
    let row = sqlx::query_as::<_, IncidentWithStats>(&format!(
        "SELECT incidents.*, agg.alert_count, agg.last_alert_at FROM incidents{} \
         WHERE incidents.id = $1",
        INCIDENT_AGGREGATES_JOIN
    ))
    .bind(incident_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// List alerts matching the filter, newest first.
/// Returns `(items, total, limit, offset)`.
pub async fn list_alerts(
    pool: &PgPool,
    filter: &AlertFilter,
) -> Result<(Vec<Alert>, i64, i64, i64)> {
    let limit = clamp_limit(filter.limit);
    let offset = filter.offset.unwrap_or(0).max(0);

    let mut count_qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM alerts WHERE 1=1");
    push_alert_filters(&mut count_qb, filter);
    let total: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("SELECT {} FROM alerts WHERE 1=1", Alert::COLUMNS));
    push_alert_filters(&mut qb, filter);
    qb.push(" ORDER BY alerts.created_at DESC OFFSET ")
        .push_bind(offset)
        .push(" LIMIT ")
        .push_bind(limit);

    let items = qb.build_query_as::<Alert>().fetch_all(pool).await?;

    Ok((items, total, limit, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamps_into_range() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-10)), 1);
        assert_eq!(clamp_limit(Some(75)), 75);
        assert_eq!(clamp_limit(Some(200)), 200);
        assert_eq!(clamp_limit(Some(2000)), 200);
    }

    #[test]
    fn service_filter_uses_containment_and_alert_exists() {
        let filter = IncidentFilter {
            service: Some("api".to_string()),
            ..IncidentFilter::default()
        };
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE 1=1");
        push_incident_filters(&mut qb, &filter);
        let sql = qb.sql();
        assert!(sql.contains("affected_services @>"));
        assert!(sql.contains("EXISTS"));
        assert!(sql.contains("alerts.service_name"));
    }

    #[test]
    fn empty_string_filters_are_ignored() {
        let filter = IncidentFilter {
            team: Some(String::new()),
            source: Some(String::new()),
            service: Some(String::new()),
            ..IncidentFilter::default()
        };
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE 1=1");
        push_incident_filters(&mut qb, &filter);
        assert_eq!(qb.sql(), "SELECT 1 WHERE 1=1");
    }

    #[test]
    fn alert_filters_compose() {
        let filter = AlertFilter {
            source: Some("datadog".to_string()),
            incident_id: Some(3),
            ..AlertFilter::default()
        };
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE 1=1");
        push_alert_filters(&mut qb, &filter);
        let sql = qb.sql();
        assert!(sql.contains("alerts.source ="));
        assert!(sql.contains("alerts.incident_id ="));
    }
}
