//! Incident summarization — deterministic summary text, citations, and
//! next-step generation, persisted as the incident's cached summary.

use crate::config::RagConfig;
use crate::error::{Error, Result};
use crate::models::{Alert, Citation, Incident, Severity};
use crate::retrieval::{
    self, build_incident_text, ScoredChunk, ScoredIncident,
};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;

/// Everything produced by one summarization pass.
#[derive(Debug)]
pub struct SummarizeResult {
    pub incident: Incident,
    pub summary: String,
    pub citations: Vec<Citation>,
    pub next_steps: Vec<String>,
    pub similar_incidents: Vec<ScoredIncident>,
    pub runbook_chunks: Vec<ScoredChunk>,
}

fn round3(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

/// Compose the summary text and its citations.
///
/// Layout: header line, then optional `Key alerts:`, `Similar incidents:`,
/// and `Relevant runbook references:` blocks. Citations are emitted in the
/// same order the blocks mention their sources.
pub fn compose_summary(
    incident: &Incident,
    alerts: &[Alert],
    similar_incidents: &[ScoredIncident],
    runbook_chunks: &[ScoredChunk],
) -> (String, Vec<Citation>) {
    let mut lines = vec![format!(
        "Incident #{} \"{}\" is {} with severity {}.",
        incident.id, incident.title, incident.status, incident.severity
    )];
    let mut citations: Vec<Citation> = Vec::new();

    let highlights: Vec<&str> = alerts
        .iter()
        .take(3)
        .filter(|a| !a.title.is_empty())
        .map(|a| a.title.as_str())
        .collect();

    if !highlights.is_empty() {
        lines.push(format!("Key alerts: {}", highlights.join("; ")));
        for alert in alerts.iter().take(3) {
            citations.push(Citation::Alert {
                id: alert.id,
                title: alert.title.clone(),
            });
        }
    }

    if !similar_incidents.is_empty() {
        lines.push("Similar incidents:".to_string());
        for item in similar_incidents {
            let score = round3(item.score);
            lines.push(format!("- #{} {} (score {})", item.incident.id, item.incident.title, score));
            citations.push(Citation::Incident {
                id: item.incident.id,
                title: item.incident.title.clone(),
                score,
            });
        }
    }

    if !runbook_chunks.is_empty() {
        lines.push("Relevant runbook references:".to_string());
        for item in runbook_chunks {
            let score = round3(item.score);
            lines.push(format!(
                "- {} (chunk {})",
                item.chunk.source_document, item.chunk.chunk_index
            ));
            citations.push(Citation::Runbook {
                source_document: item.chunk.source_document.clone(),
                chunk_index: item.chunk.chunk_index,
                title: item.chunk.title.clone(),
                score,
            });
        }
    }

    (lines.join("\n"), citations)
}

/// Ordered next steps; falls back to a generic investigation step when
/// nothing more specific applies.
pub fn build_next_steps(
    incident: &Incident,
    similar_incidents: &[ScoredIncident],
    runbook_chunks: &[ScoredChunk],
) -> Vec<String> {
    let mut steps: Vec<String> = Vec::new();

    if matches!(incident.severity, Severity::Critical | Severity::Error) {
        steps.push("Page on-call and open an incident bridge".to_string());
    }

    if !incident.services().is_empty() {
        steps.push(format!(
            "Validate service health for: {}",
            incident.services().join(", ")
        ));
    }

    if let Some(top) = similar_incidents.first() {
        steps.push(format!(
            "Review similar incident #{}: {}",
            top.incident.id, top.incident.title
        ));
    }

    if let Some(top) = runbook_chunks.first() {
        steps.push(format!(
            "Check runbook: {} (chunk {})",
            top.chunk.source_document, top.chunk.chunk_index
        ));
    }

    if steps.is_empty() {
        steps.push("Gather additional context from logs and metrics".to_string());
    }

    steps
}

/// Summarize an incident and persist the result on the incident row.
///
/// Retrieval failures degrade (keyword-only, or empty result sets); a
/// persistence failure is surfaced and leaves the previous cached summary
/// intact.
pub async fn summarize_incident(
    pool: &PgPool,
    cfg: &RagConfig,
    incident_id: i64,
    limit_similar: usize,
    limit_runbook: usize,
) -> Result<SummarizeResult> {
    let mut incident = sqlx::query_as::<_, Incident>(&format!(
        "SELECT {} FROM incidents WHERE id = $1",
        Incident::COLUMNS
    ))
    .bind(incident_id)
    .fetch_optional(pool)
    .await?
    .ok_or(Error::NotFound("Incident"))?;

    let alerts = sqlx::query_as::<_, Alert>(&format!(
        "SELECT {} FROM alerts WHERE incident_id = $1 ORDER BY alert_timestamp DESC",
        Alert::COLUMNS
    ))
    .bind(incident_id)
    .fetch_all(pool)
    .await?;

    // Refresh embeddings before retrieval
    let query_embedding = retrieval::ensure_incident_embedding(pool, &mut incident, &alerts).await?;
    retrieval::ensure_runbook_embeddings(pool).await?;

    let similar_incidents = retrieval::find_similar_incidents(
        pool,
        cfg,
        &mut incident,
        &alerts,
        limit_similar,
        cfg.min_score,
    )
    .await?;

    let query_text = build_incident_text(&incident, &alerts);
    let runbook_chunks = retrieval::find_similar_runbook_chunks(
        pool,
        cfg,
        &query_embedding,
        &query_text,
        limit_runbook,
        cfg.min_score,
    )
    .await?;

    let (summary, citations) = compose_summary(&incident, &alerts, &similar_incidents, &runbook_chunks);
    let next_steps = build_next_steps(&incident, &similar_incidents, &runbook_chunks);

    sqlx::query(
        "UPDATE incidents SET summary = $1, summary_citations = $2, next_steps = $3, \
         updated_at = NOW() WHERE id = $4",
    )
    .bind(&summary)
    .bind(Json(&citations))
    .bind(Json(&next_steps))
    .bind(incident_id)
    .execute(pool)
    .await?;

    incident.summary = Some(summary.clone());
    incident.summary_citations = Some(Json(citations.clone()));
    incident.next_steps = Some(Json(next_steps.clone()));

    info!(
        incident_id = incident_id,
        similar = similar_incidents.len(),
        runbooks = runbook_chunks.len(),
        "Incident summarized"
    );

    Ok(SummarizeResult {
        incident,
        summary,
        citations,
        next_steps,
        similar_incidents,
        runbook_chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IncidentStatus;
    use chrono::{TimeZone, Utc};
    use sqlx::types::Json;

    fn make_incident(severity: Severity, services: &[&str]) -> Incident {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Incident {
            id: 42,
            title: "Database connection failures".to_string(),
            severity,
            status: IncidentStatus::Open,
            assigned_team: Some("backend".to_string()),
            assigned_user: None,
            summary: None,
            summary_citations: None,
            next_steps: None,
            affected_services: Json(services.iter().map(|s| s.to_string()).collect()),
            incident_embedding: None,
            time_to_acknowledge: None,
            time_to_resolve: None,
            created_at: ts,
            updated_at: ts,
            resolved_at: None,
            closed_at: None,
        }
    }

    fn make_alert(id: i64, title: &str) -> Alert {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Alert {
            id,
            external_id: format!("ext-{}", id),
            source: "datadog".to_string(),
            title: title.to_string(),
            message: None,
            raw_payload: Json(serde_json::json!({})),
            alert_timestamp: ts,
            severity: None,
            predicted_team: None,
            confidence_score: None,
            classification_source: None,
            service_name: None,
            environment: None,
            region: None,
            error_code: None,
            entity_source: None,
            entity_sources: None,
            incident_id: Some(42),
            created_at: ts,
            updated_at: ts,
        }
    }

    fn make_scored_chunk(doc: &str, index: i32) -> ScoredChunk {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ScoredChunk {
            chunk: crate::models::RunbookChunk {
                id: 1,
                source: "runbooks".to_string(),
                source_uri: None,
                source_document: doc.to_string(),
                chunk_index: index,
                title: Some("Connection pools".to_string()),
                content: "How to drain a pool".to_string(),
                embedding: None,
                doc_metadata: None,
                created_at: ts,
                updated_at: ts,
            },
            score: 0.4321,
        }
    }

    #[test]
    fn summary_header_names_id_status_and_severity() {
        let incident = make_incident(Severity::Error, &[]);
        let (summary, citations) = compose_summary(&incident, &[], &[], &[]);
        assert_eq!(
            summary,
            "Incident #42 \"Database connection failures\" is open with severity error."
        );
        assert!(citations.is_empty());
    }

    #[test]
    fn key_alerts_block_lists_top_three_and_cites_them() {
        let incident = make_incident(Severity::Warning, &[]);
        let alerts: Vec<Alert> = (1..=5)
            .map(|i| make_alert(i, &format!("Alert {}", i)))
            .collect();

        let (summary, citations) = compose_summary(&incident, &alerts, &[], &[]);
        assert!(summary.contains("Key alerts: Alert 1; Alert 2; Alert 3"));
        assert!(!summary.contains("Alert 4"));

        let alert_citations: Vec<&Citation> = citations
            .iter()
            .filter(|c| matches!(c, Citation::Alert { .. }))
            .collect();
        assert_eq!(alert_citations.len(), 3);
    }

    #[test]
    fn runbook_block_cites_document_and_chunk() {
        let incident = make_incident(Severity::Warning, &[]);
        let chunks = vec![make_scored_chunk("pools.md", 2)];

        let (summary, citations) = compose_summary(&incident, &[], &[], &chunks);
        assert!(summary.contains("Relevant runbook references:"));
        assert!(summary.contains("- pools.md (chunk 2)"));
        match &citations[0] {
            Citation::Runbook {
                source_document,
                chunk_index,
                score,
                ..
            } => {
                assert_eq!(source_document, "pools.md");
                assert_eq!(*chunk_index, 2);
                assert_eq!(*score, 0.432);
            }
            other => panic!("expected runbook citation, got {:?}", other),
        }
    }

    #[test]
    fn next_steps_follow_the_priority_order() {
        let incident = make_incident(Severity::Critical, &["api", "db"]);
        let chunks = vec![make_scored_chunk("pools.md", 0)];

        let steps = build_next_steps(&incident, &[], &chunks);
        assert_eq!(steps[0], "Page on-call and open an incident bridge");
        assert_eq!(steps[1], "Validate service health for: api, db");
        assert_eq!(steps[2], "Check runbook: pools.md (chunk 0)");
    }

    #[test]
    fn severity_warning_does_not_page() {
        let incident = make_incident(Severity::Warning, &[]);
        let steps = build_next_steps(&incident, &[], &[]);
        assert_eq!(steps, vec!["Gather additional context from logs and metrics"]);
    }

    #[test]
    fn scores_round_to_three_decimals() {
        assert_eq!(round3(0.43215), 0.432);
        assert_eq!(round3(0.9999), 1.0);
    }
}
