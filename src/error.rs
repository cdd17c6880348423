//! API Error Types
//! Mission: Map internal failures to stable HTTP statuses and WS error events

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

/// Error kinds surfaced at the HTTP and WebSocket boundaries.
///
/// Classifier, artifact-storage, and session-store failures never reach the
/// boundary as their own kinds: the session core recovers them locally
/// (degraded score, `mock://` artifact keys, in-memory store fallback).
#[derive(Debug)]
pub enum ApiError {
    AuthInvalid(String),
    AuthExpired,
    RateLimited(String),
    QuotaExhausted,
    NotFound(&'static str),
    Forbidden,
    InvalidInput(String),
    InsufficientData,
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthInvalid(_) | ApiError::AuthExpired => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited(_) | ApiError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InsufficientData | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable kind, also used in webhook logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::AuthInvalid(_) => "AUTH_INVALID",
            ApiError::AuthExpired => "AUTH_EXPIRED",
            ApiError::RateLimited(_) => "RATE_LIMITED",
            ApiError::QuotaExhausted => "QUOTA_EXHAUSTED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::InsufficientData => "INSUFFICIENT_DATA",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ApiError::AuthInvalid(msg) => msg.clone(),
            ApiError::AuthExpired => "Token expired".to_string(),
            ApiError::RateLimited(msg) => msg.clone(),
            ApiError::QuotaExhausted => "Usage quota exceeded".to_string(),
            ApiError::NotFound(what) => format!("{what} not found"),
            ApiError::Forbidden => "Access denied".to_string(),
            ApiError::InvalidInput(msg) => msg.clone(),
            ApiError::InsufficientData => "Insufficient sensor data collected".to_string(),
            ApiError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref e) = self {
            error!(error = %e, "Internal error surfaced at API boundary");
        }

        let body = serde_json::json!({
            "error": self.kind(),
            "detail": self.detail(),
        });

        (self.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.detail())
    }
}

impl std::error::Error for ApiError {}
