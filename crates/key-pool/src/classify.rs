//! Failure classification for external LLM calls
//!
//! Maps a structured `CallError` to a `FailureKind`. The substring heuristics
//! live only in `DefaultClassifier`; a provider integration with better
//! signals can supply its own `Classifier`.

use provider::{CallError, FailureKind};

/// Message markers that indicate the key hit its quota or rate limit.
const QUOTA_MARKERS: &[&str] = &["429", "quota", "resource_exhausted"];

/// Message markers for status-less transport failures worth retrying.
const TRANSIENT_MARKERS: &[&str] = &["timeout", "timed out", "connection", "unavailable"];

/// Decides how the retry wrapper reacts to a failed call.
pub trait Classifier: Send + Sync {
    fn classify(&self, error: &CallError) -> FailureKind;
}

impl<F> Classifier for F
where
    F: Fn(&CallError) -> FailureKind + Send + Sync,
{
    fn classify(&self, error: &CallError) -> FailureKind {
        self(error)
    }
}

/// Status code plus case-insensitive message markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl Classifier for DefaultClassifier {
    fn classify(&self, error: &CallError) -> FailureKind {
        classify_call_error(error)
    }
}

/// Classify a failed call.
///
/// Quota signals win over everything else: status 429, or "429", "quota" or
/// "resource_exhausted" anywhere in the message. Then 408 and the retryable
/// 5xx statuses, or a status-less transport failure, are `Transient`.
/// Anything else, including 400/401/403/404, is `Fatal`.
pub fn classify_call_error(error: &CallError) -> FailureKind {
    let lower = error.message.to_lowercase();

    if error.status == Some(429) || QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureKind::QuotaExceeded;
    }

    match error.status {
        Some(408 | 500 | 502 | 503 | 504) => FailureKind::Transient,
        Some(_) => FailureKind::Fatal,
        None if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) => FailureKind::Transient,
        None => FailureKind::Fatal,
    }
}
