//! Alert intake — source-specific payload parsing and deduplicated persistence.
//!
//! Each parser normalizes a webhook payload into the fields the pipeline
//! needs and keeps the raw payload verbatim. Deduplication is by the natural
//! key `(source, external_id)`: a duplicate returns the existing alert
//! unchanged, with no re-enrichment and no re-queueing.

use crate::error::{Error, Result};
use crate::models::Alert;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};

/// Maximum stored title length (characters).
const TITLE_MAX: usize = 500;

/// Webhook sources with a registered parser.
pub const SOURCES: &[&str] = &["datadog", "sentry", "pagerduty"];

/// Normalized fields extracted from a source payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAlert {
    pub external_id: String,
    pub title: String,
    pub message: String,
    pub alert_timestamp: DateTime<Utc>,
}

/// Parse a payload for the given source. `now` supplies the timestamp
/// fallback for absent or unparseable event times.
pub fn parse_payload(source: &str, payload: &Value, now: DateTime<Utc>) -> Result<ParsedAlert> {
    match source {
        "datadog" => parse_datadog(payload, now),
        "sentry" => parse_sentry(payload, now),
        "pagerduty" => parse_pagerduty(payload, now),
        other => Err(Error::InvalidPayload(format!(
            "unknown webhook source '{}'",
            other
        ))),
    }
}

/// Datadog monitor webhook: `{id, title, body, last_updated, tags, ...}`.
fn parse_datadog(payload: &Value, now: DateTime<Utc>) -> Result<ParsedAlert> {
    let external_id = coerce_id(payload.get("id"))
        .ok_or_else(|| Error::InvalidPayload("Missing 'id' field in Datadog payload".into()))?;

    let title = payload
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Datadog Alert");
    let message = payload.get("body").and_then(Value::as_str).unwrap_or("");
    let timestamp = parse_timestamp(payload.get("last_updated"), now);

    Ok(ParsedAlert {
        external_id,
        title: truncate_title(title),
        message: message.to_string(),
        alert_timestamp: timestamp,
    })
}

/// Sentry webhook. Issue alerts arrive nested under `data.issue`; a flatter
/// legacy event shape is also accepted. The id is the only hard requirement.
fn parse_sentry(payload: &Value, now: DateTime<Utc>) -> Result<ParsedAlert> {
    let (external_id, title, message, timestamp_field) =
        if let Some(issue) = payload.pointer("/data/issue") {
            let event = payload.pointer("/data/event");
            let external_id = coerce_id(issue.get("id"));
            let title = issue
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Sentry Issue");
            let message = event
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .or_else(|| issue.pointer("/metadata/value").and_then(Value::as_str))
                .unwrap_or("");
            let timestamp = event
                .and_then(|e| e.get("timestamp"))
                .cloned()
                .or_else(|| issue.get("lastSeen").cloned());
            (external_id, title.to_string(), message.to_string(), timestamp)
        } else {
            // Direct event format
            let external_id = coerce_id(payload.get("id")).or_else(|| coerce_id(payload.get("event_id")));
            let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
            let title = payload
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if message.is_empty() {
                        "Sentry Event".to_string()
                    } else {
                        message.to_string()
                    }
                });
            (
                external_id,
                title,
                message.to_string(),
                payload.get("timestamp").cloned(),
            )
        };

    let external_id = external_id
        .ok_or_else(|| Error::InvalidPayload("Missing event/issue ID in Sentry payload".into()))?;

    Ok(ParsedAlert {
        external_id,
        title: truncate_title(&title),
        message,
        alert_timestamp: parse_timestamp(timestamp_field.as_ref(), now),
    })
}

/// PagerDuty webhook: `{messages: [{id, created_on, incident: {...}}]}`.
/// A flat `{id, title, ...}` shape is accepted as well.
fn parse_pagerduty(payload: &Value, now: DateTime<Utc>) -> Result<ParsedAlert> {
    let message_obj = payload
        .pointer("/messages/0")
        .cloned()
        .unwrap_or_else(|| payload.clone());

    let incident = message_obj.get("incident");

    let external_id = coerce_id(message_obj.get("id"))
        .or_else(|| incident.and_then(|i| coerce_id(i.get("id"))))
        .ok_or_else(|| Error::InvalidPayload("Missing 'id' field in PagerDuty payload".into()))?;

    let title = incident
        .and_then(|i| i.get("title"))
        .and_then(Value::as_str)
        .or_else(|| message_obj.get("title").and_then(Value::as_str))
        .unwrap_or("PagerDuty Incident");

    let message = incident
        .and_then(|i| i.get("description"))
        .and_then(Value::as_str)
        .or_else(|| {
            incident
                .and_then(|i| i.pointer("/trigger_summary_data/subject"))
                .and_then(Value::as_str)
        })
        .unwrap_or("");

    let timestamp = message_obj
        .get("created_on")
        .cloned()
        .or_else(|| incident.and_then(|i| i.get("created_at").cloned()));

    Ok(ParsedAlert {
        external_id,
        title: truncate_title(title),
        message: message.to_string(),
        alert_timestamp: parse_timestamp(timestamp.as_ref(), now),
    })
}

/// Persist a parsed alert, deduplicating on `(source, external_id)`.
///
/// Returns the alert row and whether it was newly created. A concurrent
/// duplicate insert loses the unique-constraint race and falls back to the
/// winner's row.
pub async fn ingest_alert(
    pool: &PgPool,
    source: &str,
    payload: &Value,
) -> Result<(Alert, bool)> {
    let parsed = parse_payload(source, payload, Utc::now())?;

    if let Some(existing) = fetch_by_natural_key(pool, source, &parsed.external_id).await? {
        info!(
            source = source,
            external_id = %parsed.external_id,
            alert_id = existing.id,
            "Duplicate alert"
        );
        return Ok((existing, false));
    }

    let insert = sqlx::query_as::<_, Alert>(&format!(
        "INSERT INTO alerts (external_id, source, title, message, raw_payload, alert_timestamp) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING {}",
        Alert::COLUMNS
    ))
    .bind(&parsed.external_id)
    .bind(source)
    .bind(&parsed.title)
    .bind(&parsed.message)
    .bind(payload)
    .bind(parsed.alert_timestamp)
    .fetch_one(pool)
    .await;

    match insert {
        Ok(alert) => {
            info!(alert_id = alert.id, source = source, title = %alert.title, "Created alert");
            Ok((alert, true))
        }
        Err(e) if is_unique_violation(&e) => {
            // Lost the insert race to a concurrent duplicate
            warn!(
                source = source,
                external_id = %parsed.external_id,
                "Concurrent duplicate insert, returning existing alert"
            );
            let existing = fetch_by_natural_key(pool, source, &parsed.external_id)
                .await?
                .ok_or(Error::NotFound("Alert"))?;
            Ok((existing, false))
        }
        Err(e) => Err(e.into()),
    }
}

async fn fetch_by_natural_key(
    pool: &PgPool,
    source: &str,
    external_id: &str,
) -> Result<Option<Alert>> {
    let alert = sqlx::query_as::<_, Alert>(&format!(
        "SELECT {} FROM alerts WHERE source = $1 AND external_id = $2",
        Alert::COLUMNS
    ))
    .bind(source)
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    Ok(alert)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

/// Coerce a JSON id (string or number) to a non-empty string.
fn coerce_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate_title(title: &str) -> String {
    title.chars().take(TITLE_MAX).collect()
}

/// Parse an ISO-8601 timestamp, falling back to `now` on absence or garbage.
fn parse_timestamp(value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = value.and_then(Value::as_str) else {
        return now;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(_) => {
            warn!(timestamp = raw, "Invalid timestamp format");
            now
        }
    }
}
