//! Opsplane server binary — HTTP surface plus the alert worker pool.
//!
//! ## Environment variables
//!
//! | Variable                      | Required | Description                              |
//! |-------------------------------|----------|------------------------------------------|
//! | `DATABASE_URL`                | Yes      | PostgreSQL connection string             |
//! | `ML_SERVICE_URL`              | No       | Classifier service (default :8001)       |
//! | `DATADOG_WEBHOOK_SECRET`      | No       | Per-source webhook signing secrets       |
//! | `SENTRY_WEBHOOK_SECRET`       | No       |                                          |
//! | `SKIP_SIGNATURE_VERIFICATION` | No       | Dev-only signature bypass                |
//! | `OPENAI_API_KEY`              | No       | Enables LLM chat streaming               |
//! | `RAG_*`                       | No       | Retrieval weights and floors             |

use anyhow::Result;
use clap::Parser;
use opsplane::api::{self, ApiState};
use opsplane::config::AppConfig;
use opsplane::{db, ingest, processor};
use opsplane::classifier::ClassifierClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "opsplane")]
#[command(about = "Opsplane incident management backplane")]
#[command(version)]
struct CliArgs {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Override the server bind address (default: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Ingest a folder of markdown documents into the knowledge base, then
    /// exit without serving
    #[arg(long, value_name = "DIR")]
    ingest_dir: Option<PathBuf>,

    /// Knowledge source label for ingested documents (e.g. runbooks, notion)
    #[arg(long, default_value = "runbooks")]
    ingest_source: String,

    /// Comma-separated tags applied to ingested documents
    #[arg(long, default_value = "")]
    ingest_tags: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,opsplane=debug")),
        )
        .init();

    let args = CliArgs::parse();
    let config = AppConfig::from_env(args.database_url, args.addr);

    if config.database_url.is_empty() {
        anyhow::bail!("DATABASE_URL must be set via --database-url or DATABASE_URL env var");
    }

    // ── Database ──────────────────────────────────────────────────────────────
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    // ── One-shot knowledge ingestion ──────────────────────────────────────────
    if let Some(dir) = args.ingest_dir {
        let tags: Vec<String> = args
            .ingest_tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let inserted = ingest::ingest_folder(&pool, &dir, &args.ingest_source, &tags).await?;
        info!(
            inserted = inserted,
            source = %args.ingest_source,
            dir = %dir.display(),
            "Knowledge ingestion complete"
        );
        return Ok(());
    }

    let config = Arc::new(config);
    info!(bind = %config.bind_address, "Starting Opsplane");

    // ── Worker pool ───────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let classifier = ClassifierClient::new(&config.ml_service_url);

    for worker_id in 0..config.worker_concurrency.max(1) {
        let worker_pool = pool.clone();
        let worker_classifier = classifier.clone();
        let worker_shutdown = shutdown.clone();
        let poll_interval = config.worker_poll_interval_secs;
        tokio::spawn(async move {
            processor::run_worker(worker_pool, worker_classifier, poll_interval, worker_shutdown)
                .await;
        });
        info!(worker_id = worker_id, "Alert worker spawned");
    }

    // ── HTTP Server ───────────────────────────────────────────────────────────
    let state = ApiState::new(pool, Arc::clone(&config));
    let app = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Opsplane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    info!("Opsplane shut down gracefully");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutdown signal received");
    shutdown.cancel();
}
