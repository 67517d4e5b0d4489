//! Chat stream endpoint — bridges the orchestrator's event channel onto a
//! server-sent-event response.

use crate::api::ApiState;
use crate::chat::{self, ChatEvent};
use crate::error::{Error, Result};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ChatStreamParams {
    pub incident_id: i64,
    pub message: String,
    pub conversation_id: Option<String>,
    pub limit_similar: Option<usize>,
    pub limit_runbook: Option<usize>,
}

fn to_sse_event(event: ChatEvent) -> std::result::Result<Event, Infallible> {
    Ok(Event::default()
        .event(event.name())
        .data(event.payload().to_string()))
}

/// GET /chat/stream — one grounded assistant turn as `text/event-stream`.
pub async fn chat_stream(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ChatStreamParams>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    if params.message.trim().is_empty() {
        return Err(Error::InvalidPayload("Message must not be empty".to_string()));
    }
    let limit_similar = params.limit_similar.unwrap_or(5).clamp(1, 20);
    let limit_runbook = params.limit_runbook.unwrap_or(5).clamp(1, 20);

    // Fail fast with a 404 before opening the stream
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM incidents WHERE id = $1")
        .bind(params.incident_id)
        .fetch_optional(&state.pool)
        .await?;
    if exists.is_none() {
        return Err(Error::NotFound("Incident"));
    }

    let events = chat::stream_chat(
        state.pool.clone(),
        Arc::clone(&state.config),
        state.http.clone(),
        params.incident_id,
        params.message,
        params.conversation_id,
        limit_similar,
        limit_runbook,
    );

    Ok(Sse::new(events.map(to_sse_event)).keep_alive(KeepAlive::default()))
}
