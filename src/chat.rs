//! Chat orchestration — incident-scoped, retrieval-grounded assistant
//! streams.
//!
//! Every stream follows one state machine: a `tool` running event, assistant
//! deltas, then exactly one terminal outcome. A failure anywhere (context
//! build, provider error, empty output) emits the failure trio
//! (`tool:failed`, `error`, `done{ok:false}`); the success trio is never
//! emitted after a failure. The emitter stops as soon as the receiving side
//! of the channel is dropped, so a client disconnect cancels the stream.
//!
//! Assistant content comes from an OpenAI-compatible provider when an API
//! key is configured, otherwise from a deterministic fallback that keeps the
//! surface useful and testable offline.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::Citation;
use crate::summarizer;
use futures::{Stream, StreamExt};
use serde_json::json;
use sqlx::PgPool;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// Width of each pseudo-delta window in the deterministic fallback.
const FALLBACK_CHUNK_CHARS: usize = 24;

/// Tool name surfaced in `tool` events.
const TOOL_NAME: &str = "incident.summarize";

/// Grounded context for one chat turn.
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub summary: String,
    pub citations: Vec<Citation>,
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Running,
    Done,
    Failed,
}

impl ToolStatus {
    fn as_str(self) -> &'static str {
        match self {
            ToolStatus::Running => "running",
            ToolStatus::Done => "done",
            ToolStatus::Failed => "failed",
        }
    }
}

/// One server-sent event in a chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Tool {
        status: ToolStatus,
    },
    AssistantDelta {
        id: String,
        delta: String,
        conversation_id: String,
    },
    Assistant {
        id: String,
        content: String,
        citations: Vec<Citation>,
        conversation_id: String,
    },
    Error {
        message: String,
    },
    Done {
        ok: bool,
    },
}

impl ChatEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Tool { .. } => "tool",
            ChatEvent::AssistantDelta { .. } => "assistant_delta",
            ChatEvent::Assistant { .. } => "assistant",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Done { .. } => "done",
        }
    }

    /// SSE data payload.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            ChatEvent::Tool { status } => json!({
                "tool": TOOL_NAME,
                "status": status.as_str(),
            }),
            ChatEvent::AssistantDelta {
                id,
                delta,
                conversation_id,
            } => json!({
                "id": id,
                "role": "assistant",
                "delta": delta,
                "conversation_id": conversation_id,
            }),
            ChatEvent::Assistant {
                id,
                content,
                citations,
                conversation_id,
            } => json!({
                "id": id,
                "role": "assistant",
                "content": content,
                "citations": citations,
                "conversation_id": conversation_id,
            }),
            ChatEvent::Error { message } => json!({ "message": message }),
            ChatEvent::Done { ok } => json!({ "ok": ok }),
        }
    }
}

/// Stream of assistant text fragments; errors terminate the turn.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Per-call unique assistant message id.
pub fn new_message_id() -> String {
    format!("assistant-{}", uuid::Uuid::new_v4().simple())
}

// ─── Deterministic fallback ───────────────────────────────────────────────────

/// Classify operator intent by keyword and assemble the reply text.
pub fn build_fallback_message(user_message: &str, summary: &str, next_steps: &[String]) -> String {
    let normalized = user_message.trim().to_lowercase();

    let wants_steps = ["next step", "what should", "what now", "action"]
        .iter()
        .any(|phrase| normalized.contains(phrase));
    if wants_steps {
        if next_steps.is_empty() {
            return "No next steps were generated for this incident.".to_string();
        }
        return format!("Recommended next steps:\n{}", numbered(next_steps));
    }

    let wants_summary = ["summary", "summarize", "recap", "status"]
        .iter()
        .any(|phrase| normalized.contains(phrase));
    if wants_summary {
        return summary.to_string();
    }

    if next_steps.is_empty() {
        return summary.to_string();
    }
    format!("{}\n\nRecommended next steps:\n{}", summary, numbered(next_steps))
}

fn numbered(steps: &[String]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(idx, step)| format!("{}. {}", idx + 1, step))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split text into fixed-size character windows for pseudo-streaming.
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    if text.is_empty() || chunk_chars == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars)
        .map(|window| window.iter().collect())
        .collect()
}

fn fallback_delta_stream(user_message: &str, context: &ChatContext) -> DeltaStream {
    let text = build_fallback_message(user_message, &context.summary, &context.next_steps);
    let chunks: Vec<Result<String>> = chunk_text(&text, FALLBACK_CHUNK_CHARS)
        .into_iter()
        .map(Ok)
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

// ─── LLM provider ─────────────────────────────────────────────────────────────

fn citation_label(citation: &Citation, idx: usize) -> String {
    match citation {
        Citation::Incident { id, title, .. } => format!("[{}] incident #{}: {}", idx, id, title),
        Citation::Alert { id, title } => format!("[{}] alert #{}: {}", idx, id, title),
        Citation::Runbook {
            source_document,
            chunk_index,
            ..
        } => format!("[{}] runbook: {} (chunk {})", idx, source_document, chunk_index),
    }
}

/// System and user messages grounding the provider in the incident context.
pub fn build_llm_messages(user_message: &str, context: &ChatContext) -> serde_json::Value {
    let citation_lines = if context.citations.is_empty() {
        "None".to_string()
    } else {
        context
            .citations
            .iter()
            .enumerate()
            .map(|(idx, c)| citation_label(c, idx + 1))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let step_lines = if context.next_steps.is_empty() {
        "None".to_string()
    } else {
        numbered(&context.next_steps)
    };

    let system = "You are the incident copilot.\n\
        Produce concise, operator-ready responses.\n\
        Formatting requirements:\n\
        - Use short paragraphs.\n\
        - Use bullet lists for grouped items.\n\
        - Use numbered lists for ordered actions.\n\
        - Keep line breaks explicit.\n\
        - Do not invent facts outside the provided context.\n\
        - If context is insufficient, state that clearly.";

    let user = format!(
        "Operator question:\n{}\n\nUse only this context:\nIncident Summary:\n{}\n\n\
         Candidate Next Steps:\n{}\n\nCitations:\n{}",
        user_message, context.summary, step_lines, citation_lines
    );

    json!([
        { "role": "system", "content": system },
        { "role": "user", "content": user },
    ])
}

/// Stream deltas from an OpenAI-compatible chat-completions endpoint.
fn openai_delta_stream(
    http: reqwest::Client,
    config: Arc<AppConfig>,
    user_message: String,
    context: ChatContext,
) -> DeltaStream {
    let (tx, rx) = mpsc::channel::<Result<String>>(32);

    tokio::spawn(async move {
        if let Err(e) = run_openai_stream(&http, &config, &user_message, &context, &tx).await {
            // Receiver may already be gone; nothing else to do then.
            let _ = tx.send(Err(e)).await;
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

async fn run_openai_stream(
    http: &reqwest::Client,
    config: &AppConfig,
    user_message: &str,
    context: &ChatContext,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    let api_key = config
        .openai_api_key
        .as_deref()
        .ok_or_else(|| Error::StreamFailure("LLM provider not configured".into()))?;

    let body = json!({
        "model": config.openai_chat_model,
        "messages": build_llm_messages(user_message, context),
        "stream": true,
    });

    let resp = http
        .post(format!("{}/v1/chat/completions", config.openai_base_url))
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::StreamFailure(format!("LLM request failed: {}", e)))?;

    if !resp.status().is_success() {
        return Err(Error::StreamFailure(format!(
            "LLM provider returned status {}",
            resp.status()
        )));
    }

    let mut buffer = String::new();
    let mut bytes = resp.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = chunk.map_err(|e| Error::StreamFailure(format!("LLM stream failed: {}", e)))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(());
            }

            let parsed: serde_json::Value = serde_json::from_str(data)
                .map_err(|e| Error::StreamFailure(format!("Malformed LLM event: {}", e)))?;
            if let Some(delta) = parsed
                .pointer("/choices/0/delta/content")
                .and_then(serde_json::Value::as_str)
            {
                if !delta.is_empty() && tx.send(Ok(delta.to_string())).await.is_err() {
                    // Client disconnected
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

// ─── State machine ────────────────────────────────────────────────────────────

/// Drive one chat turn over an event channel.
///
/// Emits `tool:running`, then either the success sequence (deltas,
/// `assistant`, `tool:done`, `done{ok:true}`) or the failure trio. Exactly
/// one terminal `done` event is emitted, matching the true outcome. Send
/// failures mean the client hung up; the turn stops quietly.
pub async fn emit_turn(
    tx: &mpsc::Sender<ChatEvent>,
    message_id: &str,
    conversation_id: &str,
    context: Result<ChatContext>,
    deltas_for: impl FnOnce(&ChatContext) -> DeltaStream,
) {
    if tx
        .send(ChatEvent::Tool {
            status: ToolStatus::Running,
        })
        .await
        .is_err()
    {
        return;
    }

    let context = match context {
        Ok(context) => context,
        Err(e) => {
            fail(tx, &e.to_string()).await;
            return;
        }
    };

    let mut deltas = deltas_for(&context);
    let mut chunks: Vec<String> = Vec::new();

    while let Some(item) = deltas.next().await {
        match item {
            Ok(delta) => {
                chunks.push(delta.clone());
                let event = ChatEvent::AssistantDelta {
                    id: message_id.to_string(),
                    delta,
                    conversation_id: conversation_id.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Chat stream failed mid-turn");
                fail(tx, &e.to_string()).await;
                return;
            }
        }
    }

    let content = chunks.concat().trim().to_string();
    if content.is_empty() {
        fail(tx, "LLM stream returned no content").await;
        return;
    }

    let assistant = ChatEvent::Assistant {
        id: message_id.to_string(),
        content,
        citations: context.citations.clone(),
        conversation_id: conversation_id.to_string(),
    };
    if tx.send(assistant).await.is_err() {
        return;
    }
    if tx
        .send(ChatEvent::Tool {
            status: ToolStatus::Done,
        })
        .await
        .is_err()
    {
        return;
    }
    let _ = tx.send(ChatEvent::Done { ok: true }).await;
}

async fn fail(tx: &mpsc::Sender<ChatEvent>, message: &str) {
    let _ = tx
        .send(ChatEvent::Tool {
            status: ToolStatus::Failed,
        })
        .await;
    let _ = tx
        .send(ChatEvent::Error {
            message: message.to_string(),
        })
        .await;
    let _ = tx.send(ChatEvent::Done { ok: false }).await;
}

// ─── Entry point ──────────────────────────────────────────────────────────────

/// Open a chat stream for an incident. The returned stream yields the event
/// sequence of one turn; dropping it cancels the emitter.
pub fn stream_chat(
    pool: PgPool,
    config: Arc<AppConfig>,
    http: reqwest::Client,
    incident_id: i64,
    user_message: String,
    conversation_id: Option<String>,
    limit_similar: usize,
    limit_runbook: usize,
) -> ReceiverStream<ChatEvent> {
    let (tx, rx) = mpsc::channel::<ChatEvent>(32);

    tokio::spawn(async move {
        let message_id = new_message_id();
        let conversation_id =
            conversation_id.unwrap_or_else(|| format!("incident-{}", incident_id));

        let context =
            build_chat_context(&pool, &config, incident_id, limit_similar, limit_runbook).await;

        let llm_enabled = config.llm_enabled();
        emit_turn(&tx, &message_id, &conversation_id, context, move |ctx| {
            if llm_enabled {
                openai_delta_stream(http, config, user_message, ctx.clone())
            } else {
                fallback_delta_stream(&user_message, ctx)
            }
        })
        .await;
    });

    ReceiverStream::new(rx)
}

/// Build the grounded context by summarizing the incident.
async fn build_chat_context(
    pool: &PgPool,
    config: &AppConfig,
    incident_id: i64,
    limit_similar: usize,
    limit_runbook: usize,
) -> Result<ChatContext> {
    let result = summarizer::summarize_incident(
        pool,
        &config.rag,
        incident_id,
        limit_similar,
        limit_runbook,
    )
    .await?;

    Ok(ChatContext {
        summary: result.summary,
        citations: result.citations,
        next_steps: result.next_steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ChatContext {
        ChatContext {
            summary: "Incident #1 \"High CPU\" is open with severity warning.".to_string(),
            citations: vec![Citation::Alert {
                id: 1,
                title: "High CPU".to_string(),
            }],
            next_steps: vec![
                "Validate service health for: api".to_string(),
                "Gather additional context from logs and metrics".to_string(),
            ],
        }
    }

    async fn collect_events(
        context_result: Result<ChatContext>,
        deltas: Vec<Result<String>>,
    ) -> Vec<ChatEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        emit_turn(&tx, "assistant-test", "incident-1", context_result, move |_| {
            Box::pin(futures::stream::iter(deltas)) as DeltaStream
        })
        .await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn successful_turn_emits_the_success_sequence() {
        let events = collect_events(
            Ok(context()),
            vec![Ok("Hello ".to_string()), Ok("operator".to_string())],
        )
        .await;

        let names: Vec<&str> = events.iter().map(ChatEvent::name).collect();
        assert_eq!(
            names,
            vec!["tool", "assistant_delta", "assistant_delta", "assistant", "tool", "done"]
        );

        match &events[3] {
            ChatEvent::Assistant { content, citations, .. } => {
                assert_eq!(content, "Hello operator");
                assert_eq!(citations.len(), 1);
            }
            other => panic!("expected assistant event, got {:?}", other),
        }
        assert_eq!(events.last(), Some(&ChatEvent::Done { ok: true }));
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_the_failure_trio_after_partial_deltas() {
        let events = collect_events(
            Ok(context()),
            vec![
                Ok("partial ".to_string()),
                Err(Error::StreamFailure("provider hung up".to_string())),
            ],
        )
        .await;

        let names: Vec<&str> = events.iter().map(ChatEvent::name).collect();
        assert_eq!(names, vec!["tool", "assistant_delta", "tool", "error", "done"]);

        assert_eq!(
            events[0],
            ChatEvent::Tool { status: ToolStatus::Running }
        );
        match &events[1] {
            ChatEvent::AssistantDelta { delta, .. } => assert_eq!(delta, "partial "),
            other => panic!("expected delta, got {:?}", other),
        }
        assert_eq!(events[2], ChatEvent::Tool { status: ToolStatus::Failed });
        assert_eq!(events.last(), Some(&ChatEvent::Done { ok: false }));

        // The success trio never appears after a failure
        assert!(!events.contains(&ChatEvent::Tool { status: ToolStatus::Done }));
        assert!(!events.contains(&ChatEvent::Done { ok: true }));
    }

    #[tokio::test]
    async fn context_build_failure_fails_before_any_delta() {
        let events = collect_events(
            Err(Error::TransientDependency("database down".to_string())),
            vec![Ok("never sent".to_string())],
        )
        .await;

        let names: Vec<&str> = events.iter().map(ChatEvent::name).collect();
        assert_eq!(names, vec!["tool", "tool", "error", "done"]);
        assert_eq!(events.last(), Some(&ChatEvent::Done { ok: false }));
    }

    #[tokio::test]
    async fn empty_stream_output_is_a_failure() {
        let events = collect_events(Ok(context()), vec![]).await;
        assert_eq!(events.last(), Some(&ChatEvent::Done { ok: false }));
        assert!(events.iter().any(|e| matches!(e, ChatEvent::Error { .. })));
    }

    #[tokio::test]
    async fn exactly_one_terminal_done_per_turn() {
        for deltas in [
            vec![Ok("fine".to_string())],
            vec![Err(Error::StreamFailure("boom".to_string()))],
            vec![],
        ] {
            let events = collect_events(Ok(context()), deltas).await;
            let done_count = events
                .iter()
                .filter(|e| matches!(e, ChatEvent::Done { .. }))
                .count();
            assert_eq!(done_count, 1);
            assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));
        }
    }

    #[test]
    fn message_ids_are_unique_per_call() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
        assert!(a.starts_with("assistant-"));
    }

    #[test]
    fn fallback_intent_next_steps() {
        let ctx = context();
        let reply = build_fallback_message("what should we do now?", &ctx.summary, &ctx.next_steps);
        assert!(reply.starts_with("Recommended next steps:\n1. Validate service health"));

        let none = build_fallback_message("next steps please", &ctx.summary, &[]);
        assert_eq!(none, "No next steps were generated for this incident.");
    }

    #[test]
    fn fallback_intent_summary() {
        let ctx = context();
        let reply = build_fallback_message("give me a recap", &ctx.summary, &ctx.next_steps);
        assert_eq!(reply, ctx.summary);
    }

    #[test]
    fn fallback_default_combines_summary_and_steps() {
        let ctx = context();
        let reply = build_fallback_message("hello there", &ctx.summary, &ctx.next_steps);
        assert!(reply.starts_with(&ctx.summary));
        assert!(reply.contains("Recommended next steps:\n1."));

        let summary_only = build_fallback_message("hello there", &ctx.summary, &[]);
        assert_eq!(summary_only, ctx.summary);
    }

    #[test]
    fn chunking_uses_24_char_windows() {
        let text = "a".repeat(50);
        let chunks = chunk_text(&text, FALLBACK_CHUNK_CHARS);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 24);
        assert_eq!(chunks[1].len(), 24);
        assert_eq!(chunks[2].len(), 2);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunking_respects_multibyte_characters() {
        let text = "é".repeat(30);
        let chunks = chunk_text(&text, FALLBACK_CHUNK_CHARS);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 24);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn tool_event_payload_shape() {
        let event = ChatEvent::Tool { status: ToolStatus::Running };
        let payload = event.payload();
        assert_eq!(payload["tool"], "incident.summarize");
        assert_eq!(payload["status"], "running");
    }

    #[test]
    fn llm_messages_carry_context_and_citations() {
        let ctx = context();
        let messages = build_llm_messages("what happened?", &ctx);
        let user = messages[1]["content"].as_str().unwrap();
        assert!(user.contains("what happened?"));
        assert!(user.contains("Incident Summary:"));
        assert!(user.contains("[1] alert #1: High CPU"));
        assert_eq!(messages[0]["role"], "system");
    }
}
