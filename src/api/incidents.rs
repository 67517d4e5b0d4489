//! Incident endpoints — listing, detail, status transitions, similarity,
//! and summarization.

use crate::api::ApiState;
use crate::error::{Error, Result};
use crate::models::{ActionType, Alert, Incident, IncidentAction, IncidentStatus};
use crate::query::{self, IncidentFilter};
use crate::{retrieval, summarizer};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

fn round3(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

async fn load_incident(state: &ApiState, incident_id: i64) -> Result<Incident> {
    sqlx::query_as::<_, Incident>(&format!(
        "SELECT {} FROM incidents WHERE id = $1",
        Incident::COLUMNS
    ))
    .bind(incident_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(Error::NotFound("Incident"))
}

async fn load_incident_alerts(state: &ApiState, incident_id: i64) -> Result<Vec<Alert>> {
    let alerts = sqlx::query_as::<_, Alert>(&format!(
        "SELECT {} FROM alerts WHERE incident_id = $1 ORDER BY alert_timestamp DESC",
        Alert::COLUMNS
    ))
    .bind(incident_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(alerts)
}

/// GET /incidents — filtered, paginated listing with aggregates.
pub async fn list_incidents(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<IncidentFilter>,
) -> Result<Json<serde_json::Value>> {
    let (items, total, limit, offset) = query::list_incidents(&state.pool, &filter).await?;
    Ok(Json(serde_json::json!({
        "items": items,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /incidents/{id} — incident detail with alerts and audit trail.
pub async fn get_incident(
    State(state): State<Arc<ApiState>>,
    Path(incident_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    let incident = query::get_incident_with_stats(&state.pool, incident_id)
        .await?
        .ok_or(Error::NotFound("Incident"))?;

    let alerts = load_incident_alerts(&state, incident_id).await?;

    let actions = sqlx::query_as::<_, IncidentAction>(&format!(
        "SELECT {} FROM incident_actions WHERE incident_id = $1 ORDER BY timestamp DESC",
        IncidentAction::COLUMNS
    ))
    .bind(incident_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(serde_json::json!({
        "incident": incident,
        "alerts": alerts,
        "actions": actions,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub status: IncidentStatus,
}

/// PATCH /incidents/{id}/status — validated lifecycle transition.
pub async fn update_status(
    State(state): State<Arc<ApiState>>,
    Path(incident_id): Path<i64>,
    Query(params): Query<StatusParams>,
) -> Result<Json<serde_json::Value>> {
    let incident = load_incident(&state, incident_id).await?;
    let next = params.status;

    if incident.status == next {
        return Ok(Json(serde_json::json!({
            "status": "no_change",
            "incident_id": incident.id,
        })));
    }

    if !incident.status.can_transition_to(next) {
        return Err(Error::InvalidStateTransition {
            from: incident.status,
            to: next,
        });
    }

    let mut tx = state.pool.begin().await?;

    sqlx::query(
        "UPDATE incidents SET \
             status = $1, \
             resolved_at = CASE WHEN $1 = 'resolved' THEN NOW() ELSE resolved_at END, \
             closed_at = CASE WHEN $1 = 'closed' THEN NOW() ELSE closed_at END, \
             updated_at = NOW() \
         WHERE id = $2",
    )
    .bind(next)
    .bind(incident.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO incident_actions (incident_id, action_type, description, actor, extra_metadata) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(incident.id)
    .bind(ActionType::StatusChange)
    .bind(format!("Status changed from {} to {}", incident.status, next))
    .bind("system")
    .bind(serde_json::json!({
        "from": incident.status.to_string(),
        "to": next.to_string(),
    }))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(incident_id = incident.id, from = %incident.status, to = %next, "Incident status updated");

    Ok(Json(serde_json::json!({
        "status": "updated",
        "incident_id": incident.id,
        "new_status": next.to_string(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SimilarParams {
    pub limit: Option<usize>,
    pub min_score: Option<f64>,
}

/// GET /incidents/{id}/similar — ranked similar incidents.
pub async fn get_similar(
    State(state): State<Arc<ApiState>>,
    Path(incident_id): Path<i64>,
    Query(params): Query<SimilarParams>,
) -> Result<Json<serde_json::Value>> {
    let limit = params.limit.unwrap_or(5).clamp(1, 50);
    let min_score = params.min_score.unwrap_or(state.config.rag.min_score);

    let mut incident = load_incident(&state, incident_id).await?;
    let alerts = load_incident_alerts(&state, incident_id).await?;

    let matches = retrieval::find_similar_incidents(
        &state.pool,
        &state.config.rag,
        &mut incident,
        &alerts,
        limit,
        min_score,
    )
    .await?;

    let items: Vec<serde_json::Value> = matches
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.incident.id,
                "title": m.incident.title,
                "status": m.incident.status,
                "severity": m.incident.severity,
                "assigned_team": m.incident.assigned_team,
                "score": round3(m.score),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "items": items,
        "total": items.len(),
        "limit": limit,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SummarizeParams {
    pub limit_similar: Option<usize>,
    pub limit_runbook: Option<usize>,
    #[serde(default)]
    pub force: bool,
}

/// POST /incidents/{id}/summarize — cached unless `force` is set.
pub async fn summarize(
    State(state): State<Arc<ApiState>>,
    Path(incident_id): Path<i64>,
    Query(params): Query<SummarizeParams>,
) -> Result<Json<serde_json::Value>> {
    let limit_similar = params.limit_similar.unwrap_or(5).clamp(1, 20);
    let limit_runbook = params.limit_runbook.unwrap_or(5).clamp(1, 20);

    let incident = load_incident(&state, incident_id).await?;

    let has_cached = incident.summary.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
        && incident
            .next_steps
            .as_ref()
            .map(|s| !s.0.is_empty())
            .unwrap_or(false);

    if has_cached && !params.force {
        let stats = query::get_incident_with_stats(&state.pool, incident_id)
            .await?
            .ok_or(Error::NotFound("Incident"))?;
        let citations = incident.summary_citations.map(|c| c.0).unwrap_or_default();
        let next_steps = incident.next_steps.map(|s| s.0).unwrap_or_default();
        return Ok(Json(serde_json::json!({
            "incident": stats,
            "summary": incident.summary,
            "citations": citations,
            "next_steps": next_steps,
            "cached": true,
        })));
    }

    let result = summarizer::summarize_incident(
        &state.pool,
        &state.config.rag,
        incident_id,
        limit_similar,
        limit_runbook,
    )
    .await?;

    let stats = query::get_incident_with_stats(&state.pool, incident_id)
        .await?
        .ok_or(Error::NotFound("Incident"))?;

    Ok(Json(serde_json::json!({
        "incident": stats,
        "summary": result.summary,
        "citations": result.citations,
        "next_steps": result.next_steps,
        "cached": false,
    })))
}
