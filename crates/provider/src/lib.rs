//! External LLM call abstraction
//!
//! Defines the `Generator` trait that the key pool's retry wrapper drives.
//! A generator takes an API key, a model identifier and prompt text and
//! returns generated text or a structured `CallError`. The error carries the
//! upstream status code and message so the failure classifier can decide
//! between key rotation, backoff and immediate failure without knowing which
//! vendor produced it.

pub mod gemini;

pub use gemini::GeminiProvider;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Classification of a failed call, driving the retry policy:
/// - QuotaExceeded marks the key exhausted and rotates to the next key
/// - Transient retries with exponential backoff
/// - Fatal surfaces immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limit or quota exhausted on the key used for the call
    QuotaExceeded,
    /// Timeouts, connection failures, 5xx
    Transient,
    /// Malformed request, invalid model, auth, anything unrecognized
    Fatal,
}

impl FailureKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
        }
    }
}

/// Maximum number of upstream body bytes kept in a `CallError`.
const MAX_MESSAGE_LEN: usize = 512;

/// Failed external call. Never contains the API key used for the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    /// HTTP status from upstream, `None` for transport failures
    pub status: Option<u16>,
    pub message: String,
}

impl CallError {
    /// Upstream answered with a non-success status.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: truncate(body.into()),
        }
    }

    /// The request never produced a response (DNS, connect, reset).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: truncate(format!("connection error: {}", message.into())),
        }
    }

    /// The request exceeded the client timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: truncate(format!("timeout: {}", message.into())),
        }
    }

    /// Upstream answered 2xx but the payload was unusable.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: truncate(format!("invalid response: {}", message.into())),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream returned {status}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CallError {}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push_str("...");
    }
    message
}

/// Errors building a generator.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid base URL: {0}")]
    BaseUrl(String),
}

/// Boxed future returned by `Generator::generate`.
pub type GenerateFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<String, CallError>> + Send + 'a>>;

/// A remote text generation endpoint.
///
/// Uses `Pin<Box<dyn Future>>` returns so callers can hold `Arc<dyn Generator>`.
pub trait Generator: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    /// Generate text for `prompt` with `model`, authenticating with `api_key`.
    fn generate<'a>(&'a self, api_key: &'a str, model: &'a str, prompt: &'a str)
    -> GenerateFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_display_includes_status() {
        let err = CallError::http(429, "RESOURCE_EXHAUSTED");
        assert_eq!(err.to_string(), "upstream returned 429: RESOURCE_EXHAUSTED");
        assert_eq!(err.status, Some(429));
    }

    #[test]
    fn transport_and_timeout_have_no_status() {
        let err = CallError::transport("refused");
        assert_eq!(err.status, None);
        assert_eq!(err.to_string(), "connection error: refused");

        let err = CallError::timeout("after 60s");
        assert!(err.message.starts_with("timeout:"));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let err = CallError::http(500, "x".repeat(2000));
        assert_eq!(err.message.len(), MAX_MESSAGE_LEN + 3);
        assert!(err.message.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "é".repeat(400);
        let err = CallError::http(500, body);
        assert!(err.message.ends_with("..."));
    }

    #[test]
    fn failure_kind_labels() {
        assert_eq!(FailureKind::QuotaExceeded.label(), "quota_exceeded");
        assert_eq!(FailureKind::Transient.label(), "transient");
        assert_eq!(FailureKind::Fatal.label(), "fatal");
    }
}
