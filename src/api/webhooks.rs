//! Webhook intake handlers.
//!
//! Signature verification happens against the raw body before any parsing.
//! Duplicates return success with the existing alert's id and are not
//! re-queued. Handlers answer quickly: enrichment is queued, never run
//! inline.

use crate::api::ApiState;
use crate::error::{Error, Result};
use crate::signature::verify_webhook_signature;
use crate::{intake, queue};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn signature_header<'h>(source: &str, headers: &'h HeaderMap) -> Option<&'h str> {
    let name = match source {
        "datadog" => "X-Datadog-Signature",
        "sentry" => "Sentry-Hook-Signature",
        "pagerduty" => "X-PagerDuty-Signature",
        _ => return None,
    };
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /webhook/{source} — receive an alert from a monitoring platform.
pub async fn receive_webhook(
    State(state): State<Arc<ApiState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    if !intake::SOURCES.contains(&source.as_str()) {
        return Err(Error::NotFound("Webhook source"));
    }

    let signature = signature_header(&source, &headers);
    if !verify_webhook_signature(&state.config, &source, &body, signature) {
        warn!(source = %source, "Rejected webhook with invalid signature");
        return Err(Error::UnauthorizedSignature);
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| Error::InvalidPayload("Invalid JSON payload".to_string()))?;

    let (alert, created) = intake::ingest_alert(&state.pool, &source, &payload).await?;

    if created {
        queue::enqueue(&state.pool, alert.id).await?;
        debug!(alert_id = alert.id, "Alert queued for processing");
    }

    info!(source = %source, alert_id = alert.id, "Webhook processed");

    Ok(Json(serde_json::json!({
        "status": "received",
        "alert_id": alert.id,
        "external_id": alert.external_id,
    })))
}
