//! Alert processing pipeline — the worker job that brings an alert from
//! ingested to fully enriched and grouped.
//!
//! Per alert: classify via the ML gateway (fallback values on failure),
//! extract entities (tag/title fallback on failure), commit the enrichment,
//! group into an incident, then refresh the incident embedding. Classifier
//! failures are swallowed into fallbacks; database failures are transient
//! and retried by the queue with exponential backoff.

use crate::classifier::{Classification, ClassifierClient, ClassifierError, ExtractedEntities};
use crate::entities::{self, EntityFields};
use crate::error::{Error, Result};
use crate::grouping;
use crate::models::{Alert, Incident, Severity};
use crate::queue::{self, AlertJob};
use crate::retrieval;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Overall per-alert processing deadline.
const TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of one successful pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    pub alert_id: i64,
    pub incident_id: i64,
    pub incident_created: bool,
}

/// Enrichment values to commit onto an alert row.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub severity: Severity,
    pub predicted_team: String,
    pub confidence_score: f64,
    pub classification_source: &'static str,
    pub fields: EntityFields,
    pub entity_source: String,
    pub entity_sources: BTreeMap<String, String>,
}

/// Text handed to the ML gateway: title plus message.
pub fn classification_text(alert: &Alert) -> String {
    format!("{}. {}", alert.title, alert.message.as_deref().unwrap_or(""))
}

/// Merge gateway results with fallbacks into the final enrichment.
///
/// Classification failure substitutes `{warning, backend, 0.0}` and marks
/// the source `fallback_rule`. Entity extraction always runs the tag/title
/// fallback afterwards to fill whatever the model left empty, and the
/// summary provenance collapses to `ml`/`tags`/`title`/`mixed`/`unknown`.
pub fn build_enrichment(
    classification: std::result::Result<Classification, ClassifierError>,
    extracted: std::result::Result<ExtractedEntities, ClassifierError>,
    raw_payload: &serde_json::Value,
    title: &str,
) -> Enrichment {
    let (severity, predicted_team, confidence_score, classification_source) = match classification
    {
        Ok(c) => (c.severity, c.team, c.confidence, "rule"),
        Err(e) => {
            warn!(error = %e, "Classification failed, using fallback values");
            (Severity::Warning, "backend".to_string(), 0.0, "fallback_rule")
        }
    };

    let mut fields = EntityFields::default();
    let mut sources: BTreeMap<String, String> = BTreeMap::new();

    match extracted {
        Ok(extracted) => {
            fields.service_name = extracted.service_name;
            fields.environment = extracted.environment;
            fields.region = extracted.region;
            fields.error_code = extracted.error_code;

            if fields.service_name.is_some() {
                sources.insert("service_name".to_string(), "ml".to_string());
            }
            if fields.environment.is_some() {
                sources.insert("environment".to_string(), "ml".to_string());
            }
            if fields.region.is_some() {
                sources.insert("region".to_string(), "ml".to_string());
            }
            if fields.error_code.is_some() {
                sources.insert("error_code".to_string(), "ml".to_string());
            }
        }
        Err(e) => {
            warn!(error = %e, "Entity extraction failed, falling back to payload tags");
        }
    }

    entities::apply_fallback_entities(&mut fields, raw_payload, title, &mut sources);
    let entity_source = entities::summarize_entity_source(&sources);

    Enrichment {
        severity,
        predicted_team,
        confidence_score,
        classification_source,
        fields,
        entity_source,
        entity_sources: sources,
    }
}

/// Bring one alert to the fully-enriched-and-grouped state.
pub async fn process_alert(
    pool: &PgPool,
    classifier: &ClassifierClient,
    alert_id: i64,
) -> Result<ProcessOutcome> {
    let alert = sqlx::query_as::<_, Alert>(&format!(
        "SELECT {} FROM alerts WHERE id = $1",
        Alert::COLUMNS
    ))
    .bind(alert_id)
    .fetch_optional(pool)
    .await?
    .ok_or(Error::NotFound("Alert"))?;

    info!(alert_id = alert_id, title = %alert.title, "Processing alert");

    let text = classification_text(&alert);
    let classification = classifier.classify(&text).await;
    let extracted = classifier.extract_entities(&text).await;
    let enrichment = build_enrichment(classification, extracted, &alert.raw_payload.0, &alert.title);

    commit_enrichment(pool, alert_id, &enrichment).await?;
    debug!(
        alert_id = alert_id,
        severity = %enrichment.severity,
        team = %enrichment.predicted_team,
        "Alert classified"
    );

    // Reload so grouping sees the enriched row
    let alert = sqlx::query_as::<_, Alert>(&format!(
        "SELECT {} FROM alerts WHERE id = $1",
        Alert::COLUMNS
    ))
    .bind(alert_id)
    .fetch_optional(pool)
    .await?
    .ok_or(Error::NotFound("Alert"))?;

    let outcome = grouping::group_alert(pool, &alert).await?;

    // Refresh the incident embedding from its current alert set
    let mut incident = sqlx::query_as::<_, Incident>(&format!(
        "SELECT {} FROM incidents WHERE id = $1",
        Incident::COLUMNS
    ))
    .bind(outcome.incident_id)
    .fetch_optional(pool)
    .await?
    .ok_or(Error::NotFound("Incident"))?;

    let incident_alerts = sqlx::query_as::<_, Alert>(&format!(
        "SELECT {} FROM alerts WHERE incident_id = $1 ORDER BY alert_timestamp DESC",
        Alert::COLUMNS
    ))
    .bind(incident.id)
    .fetch_all(pool)
    .await?;

    retrieval::ensure_incident_embedding(pool, &mut incident, &incident_alerts).await?;

    info!(
        alert_id = alert_id,
        incident_id = outcome.incident_id,
        incident_created = outcome.created,
        "Alert processed"
    );

    Ok(ProcessOutcome {
        alert_id,
        incident_id: outcome.incident_id,
        incident_created: outcome.created,
    })
}

async fn commit_enrichment(pool: &PgPool, alert_id: i64, e: &Enrichment) -> Result<()> {
    // No provenance at all persists as NULL, not an empty object
    let entity_sources = if e.entity_sources.is_empty() {
        None
    } else {
        Some(Json(&e.entity_sources))
    };

    sqlx::query(
        "UPDATE alerts SET \
             severity = $1, \
             predicted_team = $2, \
             confidence_score = $3, \
             classification_source = $4, \
             service_name = $5, \
             environment = $6, \
             region = $7, \
             error_code = $8, \
             entity_source = $9, \
             entity_sources = $10, \
             updated_at = NOW() \
         WHERE id = $11",
    )
    .bind(e.severity)
    .bind(&e.predicted_team)
    .bind(e.confidence_score)
    .bind(e.classification_source)
    .bind(&e.fields.service_name)
    .bind(&e.fields.environment)
    .bind(&e.fields.region)
    .bind(&e.fields.error_code)
    .bind(&e.entity_source)
    .bind(entity_sources)
    .bind(alert_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ─── Worker loop ──────────────────────────────────────────────────────────────

/// Run one worker claim loop until shutdown.
///
/// Drains the queue whenever jobs are due, then idles on the poll interval.
/// Each job runs under the 5-minute task timeout; transient failures are
/// rescheduled with backoff, terminal failures are parked.
pub async fn run_worker(
    pool: PgPool,
    classifier: ClassifierClient,
    poll_interval_secs: u64,
    shutdown: CancellationToken,
) {
    info!(poll_interval_secs = poll_interval_secs, "Alert worker started");

    let mut interval = tokio::time::interval(Duration::from_secs(poll_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Alert worker shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        loop {
            if shutdown.is_cancelled() {
                info!("Alert worker shutting down");
                return;
            }

            let job = match queue::claim(&pool).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to claim alert job");
                    break;
                }
            };

            run_one_job(&pool, &classifier, &job).await;
        }
    }
}

async fn run_one_job(pool: &PgPool, classifier: &ClassifierClient, job: &AlertJob) {
    debug!(job_id = job.id, alert_id = job.alert_id, attempt = job.attempt, "Claimed alert job");

    let result = tokio::time::timeout(TASK_TIMEOUT, process_alert(pool, classifier, job.alert_id)).await;

    match result {
        Ok(Ok(outcome)) => {
            if let Err(e) = queue::complete(pool, job).await {
                error!(job_id = job.id, error = %e, "Failed to mark job done");
            }
            debug!(
                job_id = job.id,
                incident_id = outcome.incident_id,
                "Alert job completed"
            );
        }
        Ok(Err(e)) if e.is_transient() => {
            warn!(job_id = job.id, alert_id = job.alert_id, error = %e, "Alert job failed, will retry");
            if let Err(qe) = queue::fail(pool, job, &e.to_string()).await {
                error!(job_id = job.id, error = %qe, "Failed to reschedule job");
            }
        }
        Ok(Err(e)) => {
            warn!(job_id = job.id, alert_id = job.alert_id, error = %e, "Alert job failed terminally");
            if let Err(qe) = queue::discard(pool, job, &e.to_string()).await {
                error!(job_id = job.id, error = %qe, "Failed to park job");
            }
        }
        Err(_) => {
            warn!(job_id = job.id, alert_id = job.alert_id, "Alert job timed out");
            if let Err(qe) = queue::fail(pool, job, "task timed out").await {
                error!(job_id = job.id, error = %qe, "Failed to reschedule job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ml_classification() -> Classification {
        Classification {
            severity: Severity::Critical,
            team: "platform".to_string(),
            confidence: 0.92,
        }
    }

    fn gateway_error() -> ClassifierError {
        ClassifierError::MalformedResponse("missing key".to_string())
    }

    #[test]
    fn successful_classification_is_applied_verbatim() {
        let enrichment = build_enrichment(
            Ok(ml_classification()),
            Ok(ExtractedEntities::default()),
            &json!({}),
            "title",
        );
        assert_eq!(enrichment.severity, Severity::Critical);
        assert_eq!(enrichment.predicted_team, "platform");
        assert_eq!(enrichment.confidence_score, 0.92);
        assert_eq!(enrichment.classification_source, "rule");
    }

    #[test]
    fn classification_failure_uses_fallback_values() {
        let enrichment = build_enrichment(
            Err(gateway_error()),
            Ok(ExtractedEntities::default()),
            &json!({}),
            "no service here",
        );
        assert_eq!(enrichment.severity, Severity::Warning);
        assert_eq!(enrichment.predicted_team, "backend");
        assert_eq!(enrichment.confidence_score, 0.0);
        assert_eq!(enrichment.classification_source, "fallback_rule");
    }

    #[test]
    fn ml_entities_get_ml_provenance_and_gaps_fall_back() {
        let extracted = ExtractedEntities {
            service_name: Some("checkout".to_string()),
            environment: None,
            region: None,
            error_code: None,
            entity_source: None,
        };
        let payload = json!({ "tags": ["env:production"] });

        let enrichment = build_enrichment(Ok(ml_classification()), Ok(extracted), &payload, "x");

        assert_eq!(enrichment.fields.service_name.as_deref(), Some("checkout"));
        assert_eq!(enrichment.fields.environment.as_deref(), Some("production"));
        assert_eq!(
            enrichment.entity_sources.get("service_name").map(String::as_str),
            Some("ml")
        );
        assert_eq!(
            enrichment.entity_sources.get("environment").map(String::as_str),
            Some("tags")
        );
        assert_eq!(enrichment.entity_source, "mixed");
    }

    #[test]
    fn extraction_failure_recovers_from_tags() {
        let payload = json!({ "tags": ["service:api", "region:eu-west-1"] });
        let enrichment =
            build_enrichment(Ok(ml_classification()), Err(gateway_error()), &payload, "x");

        assert_eq!(enrichment.fields.service_name.as_deref(), Some("api"));
        assert_eq!(enrichment.fields.region.as_deref(), Some("eu-west-1"));
        assert_eq!(enrichment.entity_source, "tags");
    }

    #[test]
    fn no_entities_anywhere_summarizes_unknown() {
        let enrichment = build_enrichment(
            Err(gateway_error()),
            Err(gateway_error()),
            &json!({}),
            "nothing recognizable",
        );
        assert_eq!(enrichment.fields, EntityFields::default());
        assert_eq!(enrichment.entity_source, "unknown");
        assert!(enrichment.entity_sources.is_empty());
    }

    #[test]
    fn reprocessing_is_idempotent_for_enrichment_values() {
        let payload = json!({ "tags": ["service:api"] });
        let a = build_enrichment(Ok(ml_classification()), Err(gateway_error()), &payload, "t");
        let b = build_enrichment(Ok(ml_classification()), Err(gateway_error()), &payload, "t");
        assert_eq!(a, b);
    }
}
