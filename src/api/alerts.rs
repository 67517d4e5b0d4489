//! Alert listing endpoint.

use crate::api::ApiState;
use crate::error::Result;
use crate::query::{self, AlertFilter};
use axum::extract::{Query, State};
use axum::Json;
use std::sync::Arc;

/// GET /alerts — filtered, paginated alert listing, newest first.
pub async fn list_alerts(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<AlertFilter>,
) -> Result<Json<serde_json::Value>> {
    let (items, total, limit, offset) = query::list_alerts(&state.pool, &filter).await?;
    Ok(Json(serde_json::json!({
        "items": items,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}
