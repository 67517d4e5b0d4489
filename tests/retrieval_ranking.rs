//! Ranking regression tests for the hybrid retrieval layer.
//!
//! These exercise the pure scoring surface end-to-end: rerank boosts,
//! relevance gating, score caps and floors.

use chrono::{TimeZone, Utc};
use opsplane::config::RagConfig;
use opsplane::embedding;
use opsplane::models::{Incident, IncidentStatus, RunbookChunk, Severity};
use opsplane::retrieval::{
    build_incident_text, keyword_rank_chunks, rank_similar_incidents,
};
use sqlx::types::Json;

fn incident(id: i64, title: &str, severity: Severity, services: &[&str]) -> Incident {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut incident = Incident {
        id,
        title: title.to_string(),
        severity,
        status: IncidentStatus::Open,
        assigned_team: None,
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
    };
    let text = build_incident_text(&incident, &[]);
    incident.incident_embedding = Some(Json(embedding::embed_text(&text)));
    incident
}

fn chunk(id: i64, title: &str, content: &str) -> RunbookChunk {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    RunbookChunk {
        id,
        source: "runbooks".to_string(),
        source_uri: None,
        source_document: format!("doc-{}.md", id),
        chunk_index: 0,
        title: Some(title.to_string()),
        content: content.to_string(),
        embedding: Some(Json(embedding::embed_text(content))),
        doc_metadata: None,
        created_at: ts,
        updated_at: ts,
    }
}

#[test]
fn title_rerank_boost_decides_between_equal_content() {
    let cfg = RagConfig::default();
    let shared = "Investigate when pool usage is high and connections pile up.";
    let chunks = vec![
        chunk(1, "Scaling notes", shared),
        chunk(2, "Pooling instructions", shared),
    ];

    let ranked = keyword_rank_chunks(&cfg, "pool", chunks, 5, 0.0);
    assert_eq!(ranked.len(), 2);
    assert_eq!(
        ranked[0].chunk.title.as_deref(),
        Some("Pooling instructions"),
        "the chunk whose title matches the query must rank first"
    );
}

#[test]
fn similarity_gate_admits_shared_service_and_rejects_unrelated() {
    let cfg = RagConfig::default();
    let subject = incident(1, "Database replication lag", Severity::Error, &["db"]);
    let candidate_a = incident(2, "Batch job memory pressure", Severity::Warning, &["db"]);
    let candidate_b = incident(3, "Frontend layout regression", Severity::Warning, &["ui"]);

    let results = rank_similar_incidents(
        &cfg,
        &subject,
        &[],
        &[candidate_a, candidate_b],
        5,
        0.1,
        0.05,
    );

    assert!(
        results.iter().any(|r| r.incident.id == 2),
        "candidate sharing the db service must be admitted"
    );
    assert!(
        results.iter().all(|r| r.incident.id != 3),
        "unrelated candidate must never be admitted"
    );
}

#[test]
fn results_are_sorted_descending_within_the_unit_interval() {
    let cfg = RagConfig::default();
    let subject = incident(1, "Cache cluster eviction storm", Severity::Error, &["cache"]);
    let candidates = vec![
        incident(2, "Cache cluster eviction storm", Severity::Error, &["cache"]),
        incident(3, "Cache latency elevated", Severity::Error, &["cache"]),
        incident(4, "Cache node restarted", Severity::Warning, &["cache"]),
    ];

    let results = rank_similar_incidents(&cfg, &subject, &[], &candidates, 5, 0.1, 0.05);
    assert!(!results.is_empty());

    for result in &results {
        assert!(result.score <= 1.0);
        assert!(result.score >= 0.1);
    }
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn floor_is_inclusive() {
    let cfg = RagConfig::default();
    let subject = incident(1, "Queue depth growing", Severity::Warning, &["queue"]);
    let candidate = incident(2, "Queue consumer stalled", Severity::Error, &["queue"]);

    let unfloored = rank_similar_incidents(&cfg, &subject, &[], &[candidate.clone()], 5, 0.0, 0.0);
    let exact_score = unfloored[0].score;

    let at_floor = rank_similar_incidents(&cfg, &subject, &[], &[candidate], 5, exact_score, 0.0);
    assert_eq!(at_floor.len(), 1, "a candidate exactly at the floor is admitted");
}
