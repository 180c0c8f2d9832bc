//! Error types for key pool operations

/// Every key in the pool is cooling down.
///
/// `retry_after_secs` is the time until the soonest cooldown expires, rounded
/// up to whole seconds so that waiting the reported time is always enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("All {total} API keys are rate-limited. Next key available in {retry_after_secs} seconds.")]
pub struct QuotaExhausted {
    pub total: usize,
    pub retry_after_secs: u64,
}

/// Errors from key pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable key found in configuration. Fatal at startup.
    #[error("no API keys configured: set {0} or {0}_1")]
    Configuration(String),

    #[error(transparent)]
    QuotaExhausted(#[from] QuotaExhausted),
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
