//! Grouping engine — time-windowed attachment of enriched alerts to open
//! incidents.
//!
//! Policy invariants:
//! - candidate incidents have status open or investigating, never terminal;
//! - candidates were created no earlier than the alert timestamp minus the
//!   5-minute window (an incident exactly at the window edge still matches);
//! - ties break to the most recently created incident.
//!
//! Attachment and the `affected_services` membership check run inside one
//! transaction, with the candidate row locked, so concurrent attachments
//! cannot drop a service from the set.

use crate::error::Result;
use crate::models::{ActionType, Alert, Incident, Severity};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

/// Grouping window: alerts attach to incidents created within the last
/// 5 minutes relative to the alert's event time.
pub const GROUPING_WINDOW_SECS: i64 = 300;

/// Result of grouping one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingOutcome {
    pub incident_id: i64,
    pub created: bool,
}

/// Earliest incident creation time still inside the window for an alert.
pub fn window_start(alert_timestamp: DateTime<Utc>) -> DateTime<Utc> {
    alert_timestamp - Duration::seconds(GROUPING_WINDOW_SECS)
}

/// Whether an incident created at `incident_created_at` is a grouping
/// candidate for an alert stamped `alert_timestamp`.
pub fn in_window(incident_created_at: DateTime<Utc>, alert_timestamp: DateTime<Utc>) -> bool {
    incident_created_at >= window_start(alert_timestamp)
}

/// Attach the alert to the most recent open incident in the window, or
/// create a new incident. Writes the audit action in the same transaction.
pub async fn group_alert(pool: &PgPool, alert: &Alert) -> Result<GroupingOutcome> {
    let mut tx = pool.begin().await?;
    let earliest = window_start(alert.alert_timestamp);

    debug!(
        alert_id = alert.id,
        earliest = %earliest,
        "Looking for grouping candidates"
    );

    let candidate = sqlx::query_as::<_, Incident>(&format!(
        "SELECT {} FROM incidents \
         WHERE status IN ('open', 'investigating') AND created_at >= $1 \
         ORDER BY created_at DESC \
         LIMIT 1 \
         FOR UPDATE",
        Incident::COLUMNS
    ))
    .bind(earliest)
    .fetch_optional(&mut *tx)
    .await?;

    let outcome = match candidate {
        Some(incident) => {
            let mut services = incident.affected_services.0.clone();
            if let Some(service) = alert.service_name.as_deref() {
                if !services.iter().any(|s| s == service) {
                    services.push(service.to_string());
                }
            }

            sqlx::query(
                "UPDATE incidents SET affected_services = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(sqlx::types::Json(&services))
            .bind(incident.id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE alerts SET incident_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(incident.id)
                .bind(alert.id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO incident_actions (incident_id, action_type, description, actor, extra_metadata) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(incident.id)
            .bind(ActionType::AlertAdded)
            .bind(format!(
                "Alert {} ({}) grouped into incident",
                alert.external_id, alert.title
            ))
            .bind("system")
            .bind(serde_json::json!({
                "alert_id": alert.id,
                "source": alert.source,
                "severity": alert.severity.map(|s| s.to_string()),
            }))
            .execute(&mut *tx)
            .await?;

            info!(
                alert_id = alert.id,
                incident_id = incident.id,
                "Alert added to existing incident"
            );

            GroupingOutcome {
                incident_id: incident.id,
                created: false,
            }
        }
        None => {
            let severity = alert.severity.unwrap_or(Severity::Warning);
            let team = alert.predicted_team.as_deref().unwrap_or("unassigned");
            let services: Vec<String> = alert.service_name.iter().cloned().collect();

            let (incident_id,): (i64,) = sqlx::query_as(
                "INSERT INTO incidents (title, severity, status, assigned_team, affected_services) \
                 VALUES ($1, $2, 'open', $3, $4) \
                 RETURNING id",
            )
            .bind(&alert.title)
            .bind(severity)
            .bind(team)
            .bind(sqlx::types::Json(&services))
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("UPDATE alerts SET incident_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(incident_id)
                .bind(alert.id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO incident_actions (incident_id, action_type, description, actor, extra_metadata) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(incident_id)
            .bind(ActionType::StatusChange)
            .bind(format!("Incident created from alert {}", alert.external_id))
            .bind("system")
            .bind(serde_json::json!({
                "trigger": "auto_grouping",
                "alert_id": alert.id,
                "alert_count": 1,
            }))
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO incident_actions (incident_id, action_type, description, actor, extra_metadata) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(incident_id)
            .bind(ActionType::AlertAdded)
            .bind(format!(
                "Alert {} ({}) grouped into incident",
                alert.external_id, alert.title
            ))
            .bind("system")
            .bind(serde_json::json!({
                "alert_id": alert.id,
                "source": alert.source,
                "severity": alert.severity.map(|s| s.to_string()),
            }))
            .execute(&mut *tx)
            .await?;

            info!(
                alert_id = alert.id,
                incident_id = incident_id,
                "Created new incident for alert"
            );

            GroupingOutcome {
                incident_id,
                created: true,
            }
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, second).unwrap()
    }

    #[test]
    fn incident_exactly_at_window_edge_is_grouped() {
        let alert_ts = at(5, 0);
        let incident_created = at(0, 0); // exactly 5 minutes earlier
        assert!(in_window(incident_created, alert_ts));
    }

    #[test]
    fn incident_just_past_window_is_not_grouped() {
        let alert_ts = at(5, 1);
        let incident_created = at(0, 0); // 5 minutes and 1 second earlier
        assert!(!in_window(incident_created, alert_ts));
    }

    #[test]
    fn recent_incident_is_grouped() {
        let alert_ts = at(2, 0);
        let incident_created = at(0, 0);
        assert!(in_window(incident_created, alert_ts));
    }

    #[test]
    fn window_start_is_five_minutes_back() {
        let alert_ts = at(10, 0);
        assert_eq!(window_start(alert_ts), at(5, 0));
    }
}
