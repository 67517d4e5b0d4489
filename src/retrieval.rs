//! Hybrid retrieval — similar incidents and runbook chunks.
//!
//! Scoring combines vector distance with lexical similarity, plus additive
//! rerank and structural boosts. Vector-only retrieval over a small corpus is
//! noisy, so similar-incident lookup applies a relevance gate (shared
//! affected service OR token overlap) before any candidate is admitted.
//!
//! Degradation ladder for runbook retrieval: vector signal unavailable →
//! keyword-only via the database full-text rank; full-text unavailable →
//! in-memory Jaccard pass over all chunks of the source.

use crate::config::RagConfig;
use crate::embedding::{self, EMBEDDING_DIM};
use crate::error::{Error, Result};
use crate::models::{Alert, Incident, RunbookChunk};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::collections::HashSet;
use tracing::{debug, warn};

/// A similar-incident match.
#[derive(Debug, Clone)]
pub struct ScoredIncident {
    pub incident: Incident,
    pub score: f64,
}

/// A runbook-chunk match.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: RunbookChunk,
    pub score: f64,
}

// ─── Scoring primitives ───────────────────────────────────────────────────────

/// Map an L2 distance into (0, 1]: identical vectors score 1.0.
pub fn similarity_from_distance(distance: f64) -> f64 {
    1.0 / (1.0 + distance)
}

/// Weighted combination of the vector and keyword signals.
pub fn hybrid_score(cfg: &RagConfig, vector_score: f64, keyword_score: f64) -> f64 {
    vector_score * cfg.vector_weight + keyword_score * cfg.keyword_weight
}

/// Additive rerank boosts: title and phrase matches apply independently.
pub fn rerank_boost(
    cfg: &RagConfig,
    query_text: &str,
    title: Option<&str>,
    content: Option<&str>,
) -> f64 {
    if query_text.is_empty() {
        return 0.0;
    }
    let lowered = query_text.to_lowercase();
    let mut boost = 0.0;
    if let Some(title) = title {
        if title.to_lowercase().contains(&lowered) {
            boost += cfg.rerank_title_boost;
        }
    }
    if let Some(content) = content {
        if content.to_lowercase().contains(&lowered) {
            boost += cfg.rerank_phrase_boost;
        }
    }
    boost
}

/// Structural boosts between incidents: severity equality and shared
/// affected services.
pub fn structural_boost(subject: &Incident, candidate: &Incident) -> f64 {
    let mut boost = 0.0;
    if subject.severity == candidate.severity {
        boost += 0.05;
    }
    if services_intersect(subject.services(), candidate.services()) {
        boost += 0.1;
    }
    boost
}

fn services_intersect(a: &[String], b: &[String]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let set: HashSet<&str> = a.iter().map(String::as_str).collect();
    b.iter().any(|s| set.contains(s.as_str()))
}

/// Relevance gate: admit when the subject and candidate share an affected
/// service, or when their token overlap clears the floor.
pub fn passes_relevance(
    query_tokens: &[String],
    candidate_tokens: &[String],
    query_services: &[String],
    candidate_services: &[String],
    min_token_overlap: f64,
) -> bool {
    if services_intersect(query_services, candidate_services) {
        return true;
    }
    embedding::jaccard(query_tokens, candidate_tokens) >= min_token_overlap
}

// ─── Incident text ────────────────────────────────────────────────────────────

/// Synthetic text for an incident: title, summary, service list, and the
/// first five alerts' titles and messages.
pub fn build_incident_text(incident: &Incident, alerts: &[Alert]) -> String {
    let mut parts: Vec<String> = vec![incident.title.clone()];

    if let Some(summary) = incident.summary.as_deref() {
        if !summary.is_empty() {
            parts.push(summary.to_string());
        }
    }
    if !incident.services().is_empty() {
        parts.push(format!("services: {}", incident.services().join(", ")));
    }

    for alert in alerts.iter().take(5) {
        if !alert.title.is_empty() {
            parts.push(alert.title.clone());
        }
        if let Some(message) = alert.message.as_deref() {
            if !message.is_empty() {
                parts.push(message.to_string());
            }
        }
    }

    parts.retain(|p| !p.is_empty());
    parts.join("\n")
}

// ─── Embedding maintenance ────────────────────────────────────────────────────

fn check_dimension(vec: &[f32]) -> Result<()> {
    if vec.len() != EMBEDDING_DIM {
        return Err(Error::InvalidPayload(format!(
            "embedding dimension {} does not match expected {}",
            vec.len(),
            EMBEDDING_DIM
        )));
    }
    Ok(())
}

/// Recompute and persist the incident's embedding from its synthetic text.
/// Mutates the in-memory incident to match.
pub async fn ensure_incident_embedding(
    pool: &PgPool,
    incident: &mut Incident,
    alerts: &[Alert],
) -> Result<Vec<f32>> {
    let text = build_incident_text(incident, alerts);
    let embedding = embedding::embed_text(&text);
    check_dimension(&embedding)?;

    sqlx::query("UPDATE incidents SET incident_embedding = $1, updated_at = NOW() WHERE id = $2")
        .bind(Json(&embedding))
        .bind(incident.id)
        .execute(pool)
        .await?;

    incident.incident_embedding = Some(Json(embedding.clone()));
    Ok(embedding)
}

/// Backfill embeddings for runbook chunks that have none. Idempotent; safe
/// to run concurrently with retrieval, since readers skip null embeddings on
/// the vector path.
pub async fn ensure_runbook_embeddings(pool: &PgPool) -> Result<u64> {
    let rows: Vec<(i64, Option<String>, String)> = sqlx::query_as(
        "SELECT id, title, content FROM runbook_chunks \
         WHERE embedding IS NULL AND source = 'runbooks'",
    )
    .fetch_all(pool)
    .await?;

    let mut updated = 0u64;
    for (id, title, content) in rows {
        let text = format!("{} {}", title.as_deref().unwrap_or(""), content);
        let embedding = embedding::embed_text(text.trim());
        check_dimension(&embedding)?;

        sqlx::query("UPDATE runbook_chunks SET embedding = $1, updated_at = NOW() WHERE id = $2")
            .bind(Json(&embedding))
            .bind(id)
            .execute(pool)
            .await?;
        updated += 1;
    }

    if updated > 0 {
        debug!(chunks = updated, "Backfilled runbook embeddings");
    }
    Ok(updated)
}

// ─── Similar incidents ────────────────────────────────────────────────────────

/// Rank candidate incidents against a subject. Vector pass over embedded
/// candidates first; when it admits nothing, a keyword-only pass over all
/// candidates with the same gate and scoring.
pub fn rank_similar_incidents(
    cfg: &RagConfig,
    subject: &Incident,
    subject_alerts: &[Alert],
    candidates: &[Incident],
    limit: usize,
    min_score: f64,
    min_keyword_overlap: f64,
) -> Vec<ScoredIncident> {
    let query_text = build_incident_text(subject, subject_alerts);
    let query_tokens = embedding::tokens(&query_text);
    let subject_embedding: Option<&[f32]> =
        subject.incident_embedding.as_ref().map(|j| j.0.as_slice());

    if let Some(query_embedding) = subject_embedding {
        let mut by_distance: Vec<(&Incident, f64)> = candidates
            .iter()
            .filter(|c| c.id != subject.id)
            .filter_map(|c| {
                c.incident_embedding
                    .as_ref()
                    .map(|e| (c, embedding::l2_distance(query_embedding, &e.0)))
            })
            .collect();
        by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));
        by_distance.truncate(limit);

        let mut results: Vec<ScoredIncident> = Vec::new();
        for (candidate, distance) in by_distance {
            let candidate_text = build_incident_text(candidate, &[]);
            let candidate_tokens = embedding::tokens(&candidate_text);
            if !passes_relevance(
                &query_tokens,
                &candidate_tokens,
                subject.services(),
                candidate.services(),
                min_keyword_overlap,
            ) {
                continue;
            }

            let vector_score = similarity_from_distance(distance);
            let keyword_score = embedding::jaccard(&query_tokens, &candidate_tokens);
            let mut score = hybrid_score(cfg, vector_score, keyword_score);
            score += rerank_boost(
                cfg,
                &query_text,
                Some(candidate.title.as_str()),
                candidate.summary.as_deref(),
            );
            score += structural_boost(subject, candidate);
            score = score.min(1.0);

            if score >= min_score {
                results.push(ScoredIncident {
                    incident: candidate.clone(),
                    score,
                });
            }
        }

        if !results.is_empty() {
            results.sort_by(|a, b| b.score.total_cmp(&a.score));
            return results;
        }
    }

    // Keyword-only pass over every other incident
    let mut matches: Vec<ScoredIncident> = Vec::new();
    for candidate in candidates.iter().filter(|c| c.id != subject.id) {
        let candidate_text = build_incident_text(candidate, &[]);
        let candidate_tokens = embedding::tokens(&candidate_text);
        if !passes_relevance(
            &query_tokens,
            &candidate_tokens,
            subject.services(),
            candidate.services(),
            min_keyword_overlap,
        ) {
            continue;
        }

        let keyword_score = embedding::jaccard(&query_tokens, &candidate_tokens);
        let mut score = hybrid_score(cfg, 0.0, keyword_score);
        score += rerank_boost(
            cfg,
            &query_text,
            Some(candidate.title.as_str()),
            candidate.summary.as_deref(),
        );
        score += structural_boost(subject, candidate);
        score = score.min(1.0);

        if score >= min_score {
            matches.push(ScoredIncident {
                incident: candidate.clone(),
                score,
            });
        }
    }

    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    matches.truncate(limit);
    matches
}

/// Find incidents similar to the subject. Computes and persists the subject
/// embedding first when it is missing.
pub async fn find_similar_incidents(
    pool: &PgPool,
    cfg: &RagConfig,
    incident: &mut Incident,
    alerts: &[Alert],
    limit: usize,
    min_score: f64,
) -> Result<Vec<ScoredIncident>> {
    if incident.incident_embedding.is_none() {
        ensure_incident_embedding(pool, incident, alerts).await?;
    }

    let candidates = sqlx::query_as::<_, Incident>(&format!(
        "SELECT {} FROM incidents WHERE id != $1",
        Incident::COLUMNS
    ))
    .bind(incident.id)
    .fetch_all(pool)
    .await?;

    Ok(rank_similar_incidents(
        cfg,
        incident,
        alerts,
        &candidates,
        limit,
        min_score,
        cfg.min_keyword_overlap,
    ))
}

// ─── Runbook chunks ───────────────────────────────────────────────────────────

struct ChunkSignals {
    chunk: RunbookChunk,
    vector_score: f64,
    bm25_score: f64,
}

/// Score merged vector/keyword signals: hybrid + rerank, capped and floored.
fn rank_chunk_signals(
    cfg: &RagConfig,
    query_text: &str,
    signals: Vec<ChunkSignals>,
    limit: usize,
    min_score: f64,
) -> Vec<ScoredChunk> {
    let mut ranked: Vec<ScoredChunk> = Vec::new();
    for entry in signals {
        let mut score = hybrid_score(cfg, entry.vector_score, entry.bm25_score);
        score += rerank_boost(
            cfg,
            query_text,
            entry.chunk.title.as_deref(),
            Some(entry.chunk.content.as_str()),
        );
        score = score.min(1.0);
        if score < min_score {
            continue;
        }
        ranked.push(ScoredChunk {
            chunk: entry.chunk,
            score,
        });
    }

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(limit);
    ranked
}

/// Last-resort ranking: Jaccard over title + content for every chunk.
pub fn keyword_rank_chunks(
    cfg: &RagConfig,
    query_text: &str,
    chunks: Vec<RunbookChunk>,
    limit: usize,
    min_score: f64,
) -> Vec<ScoredChunk> {
    let query_tokens = embedding::tokens(query_text);
    let mut matches: Vec<ScoredChunk> = Vec::new();

    for chunk in chunks {
        let chunk_text = format!("{} {}", chunk.title.as_deref().unwrap_or(""), chunk.content);
        let keyword_score = embedding::jaccard(&query_tokens, &embedding::tokens(&chunk_text));
        let mut score = hybrid_score(cfg, 0.0, keyword_score);
        score += rerank_boost(
            cfg,
            query_text,
            chunk.title.as_deref(),
            Some(chunk.content.as_str()),
        );
        score = score.min(1.0);
        if score < min_score {
            continue;
        }
        matches.push(ScoredChunk { chunk, score });
    }

    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    matches.truncate(limit);
    matches
}

/// Retrieve runbook chunks for a query embedding and text.
///
/// Both signal sources degrade independently; when neither produced a
/// candidate the in-memory Jaccard pass runs over all chunks of the source.
pub async fn find_similar_runbook_chunks(
    pool: &PgPool,
    cfg: &RagConfig,
    query_embedding: &[f32],
    query_text: &str,
    limit: usize,
    min_score: f64,
) -> Result<Vec<ScoredChunk>> {
    let mut candidates: HashMap<i64, ChunkSignals> = HashMap::new();

    // Vector signal: distance computed app-side over embedded chunks.
    match sqlx::query_as::<_, RunbookChunk>(&format!(
        "SELECT {} FROM runbook_chunks WHERE embedding IS NOT NULL AND source = 'runbooks'",
        RunbookChunk::COLUMNS
    ))
    .fetch_all(pool)
    .await
    {
        Ok(chunks) => {
            let mut by_distance: Vec<(RunbookChunk, f64)> = chunks
                .into_iter()
                .filter_map(|chunk| {
                    let distance = chunk
                        .embedding
                        .as_ref()
                        .map(|e| embedding::l2_distance(query_embedding, &e.0))?;
                    Some((chunk, distance))
                })
                .collect();
            by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));
            by_distance.truncate(limit);

            for (chunk, distance) in by_distance {
                candidates.insert(
                    chunk.id,
                    ChunkSignals {
                        chunk,
                        vector_score: similarity_from_distance(distance),
                        bm25_score: 0.0,
                    },
                );
            }
        }
        Err(e) => {
            warn!(error = %e, "Vector retrieval unavailable, continuing keyword-only");
        }
    }

    // Keyword signal: full-text rank in the database.
    match sqlx::query_as::<_, BmRow>(&format!(
        "SELECT {}, ts_rank_cd(search_tsv, plainto_tsquery('english', $1)) AS bm25 \
         FROM runbook_chunks \
         WHERE search_tsv IS NOT NULL AND source = 'runbooks' \
         ORDER BY bm25 DESC \
         LIMIT $2",
        RunbookChunk::COLUMNS
    ))
    .bind(query_text)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => {
            for row in rows {
                let bm25 = row.bm25 as f64;
                candidates
                    .entry(row.chunk.id)
                    .and_modify(|entry| entry.bm25_score = bm25)
                    .or_insert(ChunkSignals {
                        chunk: row.chunk,
                        vector_score: 0.0,
                        bm25_score: bm25,
                    });
            }
        }
        Err(e) => {
            warn!(error = %e, "Full-text retrieval unavailable");
        }
    }

    if candidates.is_empty() {
        let chunks = sqlx::query_as::<_, RunbookChunk>(&format!(
            "SELECT {} FROM runbook_chunks WHERE source = 'runbooks'",
            RunbookChunk::COLUMNS
        ))
        .fetch_all(pool)
        .await?;
        return Ok(keyword_rank_chunks(cfg, query_text, chunks, limit, min_score));
    }

    let signals: Vec<ChunkSignals> = candidates.into_values().collect();
    Ok(rank_chunk_signals(cfg, query_text, signals, limit, min_score))
}

#[derive(sqlx::FromRow)]
struct BmRow {
    #[sqlx(flatten)]
    chunk: RunbookChunk,
    bm25: f32,
}
