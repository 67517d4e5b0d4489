//! Error taxonomy for the backplane.
//!
//! The worker retries `TransientDependency`, treats everything else as
//! terminal. The HTTP layer maps each variant to a status code with a JSON
//! `{"detail": ...}` body.

use crate::models::IncidentStatus;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad or missing required input. 400 at the edge, terminal at the worker.
    #[error("{0}")]
    InvalidPayload(String),

    /// Webhook signature mismatch.
    #[error("Invalid signature")]
    UnauthorizedSignature,

    /// Entity lookup miss.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Disallowed incident status transition.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStateTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },

    /// Database blip, classifier gateway failure, and similar. Retried in the
    /// worker, substituted with fallbacks on the classifier path.
    #[error("Dependency failure: {0}")]
    TransientDependency(String),

    /// Mid-stream failure in the chat surface. Converted to a terminal
    /// failure event, never a silent truncation.
    #[error("Stream failure: {0}")]
    StreamFailure(String),
}

impl Error {
    /// Whether the worker should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientDependency(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidPayload(_) | Error::InvalidStateTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::UnauthorizedSignature => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TransientDependency(_) | Error::StreamFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::TransientDependency(format!("database error: {}", err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}
