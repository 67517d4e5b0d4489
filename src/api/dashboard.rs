//! Dashboard counters — active/critical incidents, untriaged alerts, and
//! SLA averages in whole minutes.

use crate::api::ApiState;
use crate::error::Result;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;

fn to_minutes(seconds: Option<f64>) -> Option<i64> {
    seconds.map(|s| (s / 60.0).round() as i64)
}

/// GET /dashboard/metrics
pub async fn get_metrics(State(state): State<Arc<ApiState>>) -> Result<Json<serde_json::Value>> {
    let active_incidents: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM incidents WHERE status NOT IN ('resolved', 'closed')",
    )
    .fetch_one(&state.pool)
    .await?;

    let critical_incidents: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM incidents \
         WHERE severity = 'critical' AND status NOT IN ('resolved', 'closed')",
    )
    .fetch_one(&state.pool)
    .await?;

    let untriaged_alerts: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM alerts WHERE incident_id IS NULL")
            .fetch_one(&state.pool)
            .await?;

    let mtta_seconds: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(time_to_acknowledge::double precision) FROM incidents \
         WHERE time_to_acknowledge IS NOT NULL",
    )
    .fetch_one(&state.pool)
    .await?;

    // MTTR prefers the recorded counter, else wall-clock to resolution
    let mttr_seconds: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(COALESCE( \
             time_to_resolve::double precision, \
             EXTRACT(EPOCH FROM (COALESCE(closed_at, resolved_at) - created_at))::double precision \
         )) \
         FROM incidents WHERE COALESCE(closed_at, resolved_at) IS NOT NULL",
    )
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(serde_json::json!({
        "active_incidents": active_incidents,
        "critical_incidents": critical_incidents,
        "untriaged_alerts": untriaged_alerts,
        "mtta_minutes": to_minutes(mtta_seconds),
        "mttr_minutes": to_minutes(mttr_seconds),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_are_whole_and_rounded() {
        assert_eq!(to_minutes(None), None);
        assert_eq!(to_minutes(Some(0.0)), Some(0));
        assert_eq!(to_minutes(Some(90.0)), Some(2));
        assert_eq!(to_minutes(Some(89.0)), Some(1));
        assert_eq!(to_minutes(Some(3600.0)), Some(60));
    }
}
