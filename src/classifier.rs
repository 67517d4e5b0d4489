//! Classifier Gateway — HTTP client for the remote ML inference service.
//!
//! Wraps `/classify` and `/extract-entities` with a hard 5-second deadline.
//! The gateway never retries internally; retry policy lives in the worker,
//! and on any failure the caller substitutes fallback values.

use crate::models::Severity;
use serde::Deserialize;
use std::time::Duration;

/// Per-call deadline. On expiry the call fails and fallback applies.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Classifier gateway errors
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ML service returned status {0}")]
    ServerError(reqwest::StatusCode),
    #[error("Malformed ML response: {0}")]
    MalformedResponse(String),
}

/// Severity/team classification for an alert text.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub severity: Severity,
    pub team: String,
    pub confidence: f64,
}

/// Entities extracted from an alert text. All fields best-effort.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedEntities {
    pub service_name: Option<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub error_code: Option<String>,
    pub entity_source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    severity: String,
    team: String,
    confidence: f64,
}

/// HTTP client for the ML inference service
#[derive(Clone)]
pub struct ClassifierClient {
    http: reqwest::Client,
    base_url: String,
}

impl ClassifierClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Classify alert text into severity, owning team, and confidence.
    pub async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let resp = self
            .http
            .post(format!("{}/classify", self.base_url))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClassifierError::ServerError(resp.status()));
        }

        let body: ClassifyResponse = resp
            .json()
            .await
            .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;

        let severity = parse_severity(&body.severity)?;

        if !(0.0..=1.0).contains(&body.confidence) {
            return Err(ClassifierError::MalformedResponse(format!(
                "confidence {} out of range",
                body.confidence
            )));
        }

        Ok(Classification {
            severity,
            team: body.team,
            confidence: body.confidence,
        })
    }

    /// Extract service/environment/region/error-code entities from alert text.
    pub async fn extract_entities(
        &self,
        text: &str,
    ) -> Result<ExtractedEntities, ClassifierError> {
        let resp = self
            .http
            .post(format!("{}/extract-entities", self.base_url))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClassifierError::ServerError(resp.status()));
        }

        resp.json()
            .await
            .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))
    }
}

fn parse_severity(raw: &str) -> Result<Severity, ClassifierError> {
    match raw.to_lowercase().as_str() {
        "info" => Ok(Severity::Info),
        "warning" => Ok(Severity::Warning),
        "error" => Ok(Severity::Error),
        "critical" => Ok(Severity::Critical),
        other => Err(ClassifierError::MalformedResponse(format!(
            "unknown severity '{}'",
            other
        ))),
    }
}
