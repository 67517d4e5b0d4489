//! Connector endpoints — listing and the idempotent connect transition.

use crate::api::ApiState;
use crate::error::{Error, Result};
use crate::models::{Connector, ConnectorStatus};
use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;

/// GET /connectors — all integration connectors, by name.
pub async fn list_connectors(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>> {
    let items = sqlx::query_as::<_, Connector>(
        "SELECT id, name, status, detail, updated_at FROM connectors ORDER BY name ASC",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(serde_json::json!({
        "items": items,
        "total": items.len(),
    })))
}

/// POST /connectors/{id}/connect — idempotent `not_connected → connected`.
pub async fn connect(
    State(state): State<Arc<ApiState>>,
    Path(connector_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let connector = sqlx::query_as::<_, Connector>(
        "SELECT id, name, status, detail, updated_at FROM connectors WHERE id = $1",
    )
    .bind(&connector_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(Error::NotFound("Connector"))?;

    if connector.status == ConnectorStatus::NotConnected {
        sqlx::query("UPDATE connectors SET status = 'connected', updated_at = NOW() WHERE id = $1")
            .bind(&connector.id)
            .execute(&state.pool)
            .await?;
    }

    Ok(Json(serde_json::json!({
        "status": "updated",
        "connector_id": connector.id,
        "new_status": ConnectorStatus::Connected,
    })))
}
