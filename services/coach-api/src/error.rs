//! API error responses
//!
//! Every failure leaves the service as
//! `{"error":{"code","message","request_id"}}` with a stable code. Quota
//! failures add `retry_after` and a `Retry-After` header when the wait is
//! known. Messages are fixed strings or key-pool messages, never upstream
//! bodies or key material.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use key_pool::RetryError;
use thiserror::Error;

/// Request-level failures surfaced to clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("{message}")]
    QuotaExceeded {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("Failed to generate response. Please try again.")]
    Ai,

    #[error("{0}")]
    Validation(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ApiError::Ai => "AI_ERROR",
            ApiError::Validation(_) => "VALIDATION_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Ai => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Attach the request id for the response body.
    pub fn with_request_id(self, request_id: &str) -> ErrorResponse {
        ErrorResponse {
            error: self,
            request_id: request_id.to_string(),
        }
    }
}

impl From<RetryError> for ApiError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::QuotaExhausted(exhausted) => ApiError::QuotaExceeded {
                message: exhausted.to_string(),
                retry_after: Some(exhausted.retry_after_secs),
            },
            RetryError::RateLimited { .. } => ApiError::QuotaExceeded {
                message: "All API keys are currently rate-limited. Please try again in a few minutes."
                    .into(),
                retry_after: None,
            },
            RetryError::Transient { .. } | RetryError::Fatal { .. } => ApiError::Ai,
        }
    }
}

/// An `ApiError` bound to the request it failed.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: ApiError,
    pub request_id: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": {
                "code": self.error.code(),
                "message": self.error.to_string(),
                "request_id": self.request_id,
            }
        });

        let retry_after = match &self.error {
            ApiError::QuotaExceeded { retry_after, .. } => *retry_after,
            _ => None,
        };
        if let Some(secs) = retry_after {
            body["error"]["retry_after"] = secs.into();
        }

        let mut response = (
            self.error.status(),
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
