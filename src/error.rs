use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::models::UpstreamError;
use crate::retry::Exhausted;

pub const APOLOGY: &str = "Sorry, there was an error processing your request.";

/// Everything a chat request can fail with, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),
    #[error("No API key provided")]
    MissingCredential,
    #[error("Invalid API key")]
    UpstreamAuth { details: String },
    #[error("Too many requests")]
    UpstreamRateLimit { details: String },
    #[error("Upstream model did not respond")]
    UpstreamTransient { attempts: u32, details: String },
    #[error("Invalid API response structure")]
    UpstreamShape { details: String },
    #[error("Upstream model request failed")]
    UpstreamStatus { status: u16, details: String },
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::MissingCredential | RelayError::UpstreamAuth { .. } => StatusCode::UNAUTHORIZED,
            RelayError::UpstreamRateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::UpstreamTransient { .. }
            | RelayError::UpstreamShape { .. }
            | RelayError::UpstreamStatus { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn details(&self) -> Option<String> {
        let details = match self {
            RelayError::Validation(_) | RelayError::MissingCredential => return None,
            RelayError::UpstreamAuth { details }
            | RelayError::UpstreamRateLimit { details }
            | RelayError::UpstreamShape { details } => details.clone(),
            RelayError::UpstreamTransient { attempts, details } => format!("{details} (after {attempts} attempts)"),
            RelayError::UpstreamStatus { status, details } => format!("status {status}: {details}"),
        };
        (!details.is_empty()).then_some(details)
    }
}

impl From<Exhausted<UpstreamError>> for RelayError {
    fn from(e: Exhausted<UpstreamError>) -> Self {
        match e.error {
            UpstreamError::Auth { body } => RelayError::UpstreamAuth { details: body },
            UpstreamError::RateLimited { body } => RelayError::UpstreamRateLimit { details: body },
            UpstreamError::Transient { reason } => RelayError::UpstreamTransient { attempts: e.attempts, details: reason },
            UpstreamError::Shape { reason } => RelayError::UpstreamShape { details: reason },
            UpstreamError::Status { status, body } => RelayError::UpstreamStatus { status, details: body },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Empty, so the preview keeps whatever it showed before.
    pub content: String,
    pub chat_text: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
            content: String::new(),
            chat_text: APOLOGY.into(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
