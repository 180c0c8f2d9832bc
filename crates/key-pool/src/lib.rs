//! API key rotation and retry for rate-limited LLM providers
//!
//! Holds a fixed pool of API keys loaded once at startup, hands out keys
//! round-robin while skipping keys in cooldown, and wraps each external call
//! in a bounded retry policy with key rotation, exponential backoff and an
//! optional fallback model.
//!
//! Call lifecycle:
//! 1. `RetryExecutor::call` asks the `RotationManager` for an available key
//! 2. The `Generator` makes the external call with that key
//! 3. On a quota failure the key enters cooldown and the next key is tried at once
//! 4. On a transient failure the executor sleeps with exponential backoff
//! 5. When every key is cooling down the executor waits for the soonest expiry
//!    (if the policy allows pool waits) or surfaces `QuotaExhausted`
//! 6. When the budgets run out the fallback model gets exactly one attempt

pub mod classify;
pub mod error;
pub mod loader;
pub mod retry;
pub mod rotation;

pub use classify::{Classifier, DefaultClassifier, classify_call_error};
pub use error::{Error, QuotaExhausted, Result};
pub use loader::{Credential, DEFAULT_KEY_VAR, KeyPool, MAX_NUMBERED_KEYS};
pub use retry::{Backoff, RetryError, RetryExecutor, RetryPolicy};
pub use rotation::{DEFAULT_COOLDOWN, KeyStatus, MAX_COOLDOWN, RotationManager};
