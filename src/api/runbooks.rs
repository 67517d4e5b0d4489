//! Runbook endpoints — document index and hybrid search.

use crate::api::ApiState;
use crate::embedding;
use crate::error::{Error, Result};
use crate::models::RunbookChunk;
use crate::retrieval;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One logical document assembled from its chunks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunbookIndexEntry {
    pub id: String,
    pub title: String,
    pub source: String,
    pub source_type: Option<String>,
    pub source_uri: Option<String>,
    pub tags: Vec<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Collapse chunks into one entry per source document, ordered by document
/// name, with merged tags and the newest update time.
pub fn build_runbook_index(chunks: &[RunbookChunk]) -> Vec<RunbookIndexEntry> {
    struct Entry {
        title: String,
        tags: Vec<String>,
        updated_at: Option<DateTime<Utc>>,
        source_type: Option<String>,
        source_uri: Option<String>,
    }

    let mut documents: BTreeMap<String, Entry> = BTreeMap::new();

    for chunk in chunks {
        let tags: Vec<String> = chunk
            .doc_metadata
            .as_ref()
            .and_then(|m| m.0.get("tags"))
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let updated_at = Some(chunk.updated_at);

        match documents.get_mut(&chunk.source_document) {
            None => {
                documents.insert(
                    chunk.source_document.clone(),
                    Entry {
                        title: chunk
                            .title
                            .clone()
                            .unwrap_or_else(|| chunk.source_document.clone()),
                        tags,
                        updated_at,
                        source_type: Some(chunk.source.clone()),
                        source_uri: chunk.source_uri.clone(),
                    },
                );
            }
            Some(entry) => {
                if updated_at > entry.updated_at {
                    entry.updated_at = updated_at;
                }
                for tag in tags {
                    if !entry.tags.contains(&tag) {
                        entry.tags.push(tag);
                    }
                }
                if entry.source_uri.is_none() {
                    entry.source_uri = chunk.source_uri.clone();
                }
            }
        }
    }

    documents
        .into_iter()
        .enumerate()
        .map(|(index, (document, entry))| RunbookIndexEntry {
            id: format!("RB-{:03}", index + 1),
            title: entry.title,
            source: document,
            source_type: entry.source_type,
            source_uri: entry.source_uri,
            tags: entry.tags,
            last_updated: entry.updated_at,
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /runbooks — distinct-document index.
pub async fn list_runbooks(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>> {
    let limit = params.limit.unwrap_or(100);
    let offset = params.offset.unwrap_or(0);

    let chunks = sqlx::query_as::<_, RunbookChunk>(&format!(
        "SELECT {} FROM runbook_chunks WHERE source = 'runbooks' \
         ORDER BY source_document ASC, chunk_index ASC",
        RunbookChunk::COLUMNS
    ))
    .fetch_all(&state.pool)
    .await?;

    let items = build_runbook_index(&chunks);
    let total = items.len();
    let page: Vec<_> = items.into_iter().skip(offset).take(limit).collect();

    Ok(Json(serde_json::json!({
        "items": page,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<usize>,
}

/// GET /runbooks/search — hybrid retrieval over runbook chunks.
pub async fn search_runbooks(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>> {
    if params.q.trim().chars().count() < 2 {
        return Err(Error::InvalidPayload(
            "Query must be at least 2 characters".to_string(),
        ));
    }
    let limit = params.limit.unwrap_or(5).clamp(1, 50);

    retrieval::ensure_runbook_embeddings(&state.pool).await?;
    let query_embedding = embedding::embed_text(&params.q);

    let matches = retrieval::find_similar_runbook_chunks(
        &state.pool,
        &state.config.rag,
        &query_embedding,
        &params.q,
        limit,
        state.config.rag.min_score,
    )
    .await?;

    let items: Vec<serde_json::Value> = matches
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.chunk.id,
                "score": m.score,
                "source": m.chunk.source,
                "source_uri": m.chunk.source_uri,
                "source_document": m.chunk.source_document,
                "chunk_index": m.chunk.chunk_index,
                "title": m.chunk.title,
                "content": m.chunk.content,
                "metadata": m.chunk.doc_metadata.as_ref().map(|m| &m.0),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "items": items,
        "total": items.len(),
        "limit": limit,
        "query": params.q,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::types::Json as SqlxJson;

    fn chunk(doc: &str, index: i32, title: Option<&str>, tags: &[&str], hour: u32) -> RunbookChunk {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
        RunbookChunk {
            id: index as i64,
            source: "runbooks".to_string(),
            source_uri: None,
            source_document: doc.to_string(),
            chunk_index: index,
            title: title.map(str::to_string),
            content: "content".to_string(),
            embedding: None,
            doc_metadata: Some(SqlxJson(serde_json::json!({ "tags": tags }))),
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn index_collapses_chunks_per_document() {
        let chunks = vec![
            chunk("b.md", 0, Some("Backups"), &["storage"], 1),
            chunk("b.md", 1, None, &["infra"], 3),
            chunk("a.md", 0, Some("Alerting"), &[], 2),
        ];

        let index = build_runbook_index(&chunks);
        assert_eq!(index.len(), 2);
        // Sorted by document name, ids are ordinal
        assert_eq!(index[0].source, "a.md");
        assert_eq!(index[0].id, "RB-001");
        assert_eq!(index[1].source, "b.md");
        assert_eq!(index[1].id, "RB-002");

        // Tags merged, newest update wins, first title wins
        let b = &index[1];
        assert_eq!(b.title, "Backups");
        assert_eq!(b.tags, vec!["storage", "infra"]);
        assert_eq!(
            b.last_updated,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap())
        );
    }

    #[test]
    fn untitled_documents_fall_back_to_the_file_name() {
        let index = build_runbook_index(&[chunk("plain.md", 0, None, &[], 0)]);
        assert_eq!(index[0].title, "plain.md");
    }
}
