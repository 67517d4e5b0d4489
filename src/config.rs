//! Application configuration — environment variables, CLI overrides, defaults.

use tracing::warn;

/// Retrieval scoring weights and floors. All overridable via `RAG_*`
/// environment variables.
#[derive(Debug, Clone, Copy)]
pub struct RagConfig {
    /// Weight of the vector-distance score in the hybrid combination.
    pub vector_weight: f64,
    /// Weight of the lexical (full-text or Jaccard) score.
    pub keyword_weight: f64,
    /// Relevance floor. Candidates scoring below this are dropped;
    /// candidates exactly at the floor are admitted.
    pub min_score: f64,
    /// Minimum token overlap for the similar-incident relevance gate.
    pub min_keyword_overlap: f64,
    /// Additive boost when the query is a substring of a result title.
    pub rerank_title_boost: f64,
    /// Additive boost when the query is a substring of a result body.
    pub rerank_phrase_boost: f64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.7,
            keyword_weight: 0.3,
            min_score: 0.1,
            min_keyword_overlap: 0.05,
            rerank_title_boost: 0.08,
            rerank_phrase_boost: 0.05,
        }
    }
}

/// Backplane configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Connection pool size, shared by handlers, workers, and chat emitters
    pub db_max_connections: u32,
    /// How long a task may wait for a pooled connection, in seconds
    pub db_acquire_timeout_secs: u64,
    /// Bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,
    /// Base URL of the ML inference service
    pub ml_service_url: String,
    /// Per-source webhook secrets
    pub datadog_webhook_secret: Option<String>,
    pub sentry_webhook_secret: Option<String>,
    pub pagerduty_webhook_secret: Option<String>,
    /// Development-only bypass for webhook signature checks
    pub skip_signature_verification: bool,
    /// Retrieval weights and floors
    pub rag: RagConfig,
    /// LLM provider toggle. Chat streams use the deterministic fallback
    /// when unset.
    pub openai_api_key: Option<String>,
    pub openai_chat_model: String,
    pub openai_base_url: String,
    /// Number of concurrent worker claim loops
    pub worker_concurrency: usize,
    /// Queue poll interval when idle, in seconds
    pub worker_poll_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_max_connections: 20,
            db_acquire_timeout_secs: 10,
            bind_address: "0.0.0.0:8080".to_string(),
            ml_service_url: "http://localhost:8001".to_string(),
            datadog_webhook_secret: None,
            sentry_webhook_secret: None,
            pagerduty_webhook_secret: None,
            skip_signature_verification: false,
            rag: RagConfig::default(),
            openai_api_key: None,
            openai_chat_model: "gpt-4o-mini".to_string(),
            openai_base_url: "https://api.openai.com".to_string(),
            worker_concurrency: 2,
            worker_poll_interval_secs: 2,
        }
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %v, "Ignoring unparseable numeric override");
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.to_lowercase();
            v == "true" || v == "1" || v == "yes"
        })
        .unwrap_or(false)
}

impl AppConfig {
    /// Load configuration from environment variables with CLI overrides.
    pub fn from_env(database_url: Option<String>, bind_address: Option<String>) -> Self {
        let mut config = Self::default();

        // Database URL: CLI arg > env var
        config.database_url = database_url
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .unwrap_or_default();

        if let Ok(v) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                config.db_max_connections = n;
            }
        }
        if let Ok(v) = std::env::var("DATABASE_ACQUIRE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.db_acquire_timeout_secs = n;
            }
        }

        if let Some(addr) = bind_address {
            config.bind_address = addr;
        } else if let Ok(addr) = std::env::var("OPSPLANE_BIND_ADDR") {
            config.bind_address = addr;
        }

        if let Ok(url) = std::env::var("ML_SERVICE_URL") {
            config.ml_service_url = url;
        }

        config.datadog_webhook_secret = std::env::var("DATADOG_WEBHOOK_SECRET").ok();
        config.sentry_webhook_secret = std::env::var("SENTRY_WEBHOOK_SECRET").ok();
        config.pagerduty_webhook_secret = std::env::var("PAGERDUTY_WEBHOOK_SECRET").ok();

        config.skip_signature_verification = env_flag("SKIP_SIGNATURE_VERIFICATION");
        if config.skip_signature_verification {
            warn!("Signature verification disabled - NOT FOR PRODUCTION");
        }

        config.rag = RagConfig {
            vector_weight: env_f64("RAG_VECTOR_WEIGHT", config.rag.vector_weight),
            keyword_weight: env_f64("RAG_KEYWORD_WEIGHT", config.rag.keyword_weight),
            min_score: env_f64("RAG_MIN_SCORE", config.rag.min_score),
            min_keyword_overlap: env_f64(
                "RAG_MIN_KEYWORD_OVERLAP",
                config.rag.min_keyword_overlap,
            ),
            rerank_title_boost: env_f64("RAG_RERANK_TITLE_BOOST", config.rag.rerank_title_boost),
            rerank_phrase_boost: env_f64(
                "RAG_RERANK_PHRASE_BOOST",
                config.rag.rerank_phrase_boost,
            ),
        };

        config.openai_api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        if let Ok(model) = std::env::var("OPENAI_CHAT_MODEL") {
            config.openai_chat_model = model;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.openai_base_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(v) = std::env::var("WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                config.worker_concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("WORKER_POLL_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                config.worker_poll_interval_secs = n;
            }
        }

        config
    }

    /// Secret configured for a webhook source, if any.
    pub fn webhook_secret(&self, source: &str) -> Option<&str> {
        match source {
            "datadog" => self.datadog_webhook_secret.as_deref(),
            "sentry" => self.sentry_webhook_secret.as_deref(),
            "pagerduty" => self.pagerduty_webhook_secret.as_deref(),
            _ => None,
        }
    }

    /// Whether an LLM provider is configured for chat streaming.
    pub fn llm_enabled(&self) -> bool {
        self.openai_api_key.is_some()
    }
}
