//! Runbook ingestion — markdown chunking and idempotent knowledge-base
//! loading.
//!
//! Documents are split on paragraph boundaries into chunks of at most 2400
//! characters, with a 200-character overlap carried into each following
//! chunk. Re-ingesting an unchanged document (same content hash) is a no-op;
//! a changed document replaces all of its chunks.

use crate::embedding;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::PgPool;
use std::path::Path;
use tracing::info;

const MAX_CHUNK_CHARS: usize = 2400;
const OVERLAP_CHARS: usize = 200;

/// One chunk of a source document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub content: String,
    pub chunk_index: i32,
    pub title: Option<String>,
}

/// Content hash used to detect unchanged documents.
pub fn compute_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// First markdown heading in the document, if any.
pub fn extract_title(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix('#')
            .map(|rest| rest.trim_start_matches('#').trim().to_string())
    })
}

/// Split markdown into paragraph-packed chunks with overlap.
pub fn chunk_markdown(text: &str) -> Vec<DocumentChunk> {
    let title = extract_title(text);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() && !buffer.is_empty() {
            paragraphs.push(buffer.join("\n").trim().to_string());
            buffer.clear();
        } else {
            buffer.push(line);
        }
    }
    if !buffer.is_empty() {
        paragraphs.push(buffer.join("\n").trim().to_string());
    }

    let mut chunks: Vec<DocumentChunk> = Vec::new();
    let mut current = String::new();

    let flush = |chunks: &mut Vec<DocumentChunk>, current: &mut String| {
        if !current.trim().is_empty() {
            chunks.push(DocumentChunk {
                content: current.trim().to_string(),
                chunk_index: chunks.len() as i32,
                title: title.clone(),
            });
        }
        current.clear();
    };

    for para in paragraphs.iter().filter(|p| !p.is_empty()) {
        if current.chars().count() + para.chars().count() + 2 <= MAX_CHUNK_CHARS {
            if current.is_empty() {
                current = para.clone();
            } else {
                current = format!("{}\n\n{}", current, para);
            }
        } else {
            flush(&mut chunks, &mut current);
            current = para.clone();
        }
    }
    flush(&mut chunks, &mut current);

    // Prepend the tail of each previous chunk so context survives the split
    if chunks.len() > 1 {
        for idx in 1..chunks.len() {
            let prev_chars: Vec<char> = chunks[idx - 1].content.chars().collect();
            let start = prev_chars.len().saturating_sub(OVERLAP_CHARS);
            let overlap: String = prev_chars[start..].iter().collect();
            chunks[idx].content = format!("{}\n{}", overlap, chunks[idx].content);
        }
    }

    chunks
}

/// Ingest every `*.md` file in a folder under the given source label.
/// Returns the number of chunks inserted.
pub async fn ingest_folder(
    pool: &PgPool,
    folder: &Path,
    source: &str,
    tags: &[String],
) -> Result<u64> {
    let mut paths: Vec<_> = std::fs::read_dir(folder)
        .map_err(|e| Error::InvalidPayload(format!("cannot read {}: {}", folder.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|ext| ext == "md").unwrap_or(false))
        .collect();
    paths.sort();

    let mut inserted = 0u64;

    for path in paths {
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if !name.to_lowercase().starts_with("readme") => name.to_string(),
            _ => continue,
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::InvalidPayload(format!("cannot read {}: {}", path.display(), e)))?;
        let version_hash = compute_hash(&content);
        let chunks = chunk_markdown(&content);

        let existing_hash: Option<(Option<Json<serde_json::Value>>,)> = sqlx::query_as(
            "SELECT doc_metadata FROM runbook_chunks \
             WHERE source_document = $1 AND source = $2 LIMIT 1",
        )
        .bind(&file_name)
        .bind(source)
        .fetch_optional(pool)
        .await?;

        if let Some((Some(metadata),)) = &existing_hash {
            if metadata.0.get("version_hash").and_then(|v| v.as_str()) == Some(&version_hash) {
                continue;
            }
        }

        sqlx::query("DELETE FROM runbook_chunks WHERE source_document = $1 AND source = $2")
            .bind(&file_name)
            .bind(source)
            .execute(pool)
            .await?;

        for chunk in &chunks {
            let chunk_embedding = embedding::embed_text(&chunk.content);
            if chunk_embedding.len() != embedding::EMBEDDING_DIM {
                return Err(Error::InvalidPayload(format!(
                    "embedding dimension {} does not match expected {}",
                    chunk_embedding.len(),
                    embedding::EMBEDDING_DIM
                )));
            }

            let metadata = serde_json::json!({
                "tags": tags,
                "source": source,
                "version_hash": version_hash,
                "title": chunk.title,
            });

            sqlx::query(
                "INSERT INTO runbook_chunks \
                 (source, source_uri, source_document, chunk_index, title, content, embedding, doc_metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(source)
            .bind(path.to_string_lossy().as_ref())
            .bind(&file_name)
            .bind(chunk.chunk_index)
            .bind(&chunk.title)
            .bind(&chunk.content)
            .bind(Json(&chunk_embedding))
            .bind(&metadata)
            .execute(pool)
            .await?;
            inserted += 1;
        }

        info!(document = %file_name, chunks = chunks.len(), "Ingested runbook document");
    }

    Ok(inserted)
}
