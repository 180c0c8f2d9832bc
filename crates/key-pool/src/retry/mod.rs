//! Bounded retry around one external LLM call
//!
//! `RetryExecutor::call` drives the pure state machine in `machine` against
//! a `Generator`, the shared `RotationManager` and a `Classifier`:
//!
//! - quota failures mark the key exhausted and retry at once with the next key
//! - transient failures sleep an exponential backoff before retrying
//! - a fully cooling pool is waited out (if the policy allows) for the
//!   reported time, otherwise surfaced as `RetryError::QuotaExhausted`
//! - fatal failures surface immediately
//! - when the primary budgets run out, the fallback model gets one attempt
//!
//! The number of external calls per invocation is bounded by
//! `RetryPolicy::max_calls`.

pub mod machine;

use std::sync::Arc;
use std::time::Duration;

use provider::{CallError, FailureKind, Generator};
use tracing::{debug, info, warn};

use crate::classify::{Classifier, DefaultClassifier};
use crate::error::QuotaExhausted;
use crate::rotation::RotationManager;

use machine::{ModelChoice, RetryAction, RetryEvent, RetryState, handle_event};

/// Exponential backoff: `min * multiplier^(n-1)` clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub multiplier: u32,
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `n` (1-based).
    pub fn delay(&self, n: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(n.saturating_sub(1));
        self.min.saturating_mul(factor).clamp(self.min, self.max)
    }
}

/// Budgets and timings for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Calls on the primary model that may fail with a quota error
    pub max_key_rotations: u32,
    /// Cooldown applied to a key that hit its quota
    pub quota_cooldown: Duration,
    /// Transient failures retried with backoff on the primary model
    pub max_transient_retries: u32,
    pub backoff: Backoff,
    /// Times a fully cooling pool is waited out before giving up
    pub max_pool_waits: u32,
    /// Model given one attempt once the primary budgets are spent
    pub fallback_model: Option<String>,
}

impl RetryPolicy {
    /// Interactive chat: 3 attempts, 2-minute cooldown, backoff ×3 in
    /// [10s, 120s]. A fully cooling pool is reported to the caller right away
    /// so the client can show the retry hint.
    pub fn primary(fallback_model: Option<String>) -> Self {
        Self {
            max_key_rotations: 3,
            quota_cooldown: Duration::from_secs(120),
            max_transient_retries: 2,
            backoff: Backoff {
                multiplier: 3,
                min: Duration::from_secs(10),
                max: Duration::from_secs(120),
            },
            max_pool_waits: 0,
            fallback_model,
        }
    }

    /// Pipeline stages: 5 rotations, 1-minute cooldown, backoff ×2 in
    /// [5s, 60s], and up to 5 waits for the pool to recover.
    pub fn orchestration() -> Self {
        Self {
            max_key_rotations: 5,
            quota_cooldown: Duration::from_secs(60),
            max_transient_retries: 2,
            backoff: Backoff {
                multiplier: 2,
                min: Duration::from_secs(5),
                max: Duration::from_secs(60),
            },
            max_pool_waits: 5,
            fallback_model: None,
        }
    }

    /// Upper bound on external calls for one invocation.
    pub fn max_calls(&self) -> u32 {
        self.max_key_rotations
            + self.max_transient_retries
            + u32::from(self.fallback_model.is_some())
    }
}

/// Typed failure of a retried call. Never contains a key.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Every key is cooling down and the policy allows no further waiting
    #[error(transparent)]
    QuotaExhausted(#[from] QuotaExhausted),

    /// Quota errors used up the rotation budget
    #[error("rate limited after {attempts} attempts: {source}")]
    RateLimited { attempts: u32, source: CallError },

    /// Transient errors used up the retry budget
    #[error("call failed after {attempts} attempts: {source}")]
    Transient { attempts: u32, source: CallError },

    /// Not retryable
    #[error("call failed: {source}")]
    Fatal { attempts: u32, source: CallError },
}

impl RetryError {
    /// Seconds until a key frees up, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RetryError::QuotaExhausted(e) => Some(e.retry_after_secs),
            _ => None,
        }
    }

    /// Whether the failure was a quota condition (pool or rotation budget).
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            RetryError::QuotaExhausted(_) | RetryError::RateLimited { .. }
        )
    }
}

/// Runs external calls under a `RetryPolicy`.
pub struct RetryExecutor {
    generator: Arc<dyn Generator>,
    keys: Arc<RotationManager>,
    classifier: Arc<dyn Classifier>,
}

impl RetryExecutor {
    pub fn new(generator: Arc<dyn Generator>, keys: Arc<RotationManager>) -> Self {
        Self::with_classifier(generator, keys, Arc::new(DefaultClassifier))
    }

    pub fn with_classifier(
        generator: Arc<dyn Generator>,
        keys: Arc<RotationManager>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            generator,
            keys,
            classifier,
        }
    }

    /// The rotation manager this executor draws keys from.
    pub fn keys(&self) -> &Arc<RotationManager> {
        &self.keys
    }

    /// Call `model` with `prompt`, retrying per `policy`.
    pub async fn call(
        &self,
        model: &str,
        prompt: &str,
        policy: &RetryPolicy,
    ) -> Result<String, RetryError> {
        let mut state = RetryState::start();
        let mut last_failure: Option<(FailureKind, CallError)> = None;

        loop {
            let model_id = match state.model {
                ModelChoice::Primary => model,
                ModelChoice::Fallback => policy.fallback_model.as_deref().unwrap_or(model),
            };

            let (event, pool_exhausted) = match self.keys.get_available_key().await {
                Err(exhausted) => (
                    RetryEvent::PoolExhausted {
                        retry_after: Duration::from_secs(exhausted.retry_after_secs),
                    },
                    Some(exhausted),
                ),
                Ok(credential) => {
                    debug!(
                        provider = self.generator.id(),
                        model = model_id,
                        key = %credential.label(),
                        attempt = state.calls + 1,
                        "calling LLM"
                    );
                    match self
                        .generator
                        .generate(credential.expose(), model_id, prompt)
                        .await
                    {
                        Ok(text) => {
                            metrics::counter!("llm_calls_total", "model" => model_id.to_string(), "outcome" => "success")
                                .increment(1);
                            let (done, _) = handle_event(state, RetryEvent::Succeeded, policy);
                            if done.calls > 1 {
                                info!(model = model_id, calls = done.calls, "LLM call succeeded after retries");
                            }
                            return Ok(text);
                        }
                        Err(error) => {
                            let kind = self.classifier.classify(&error);
                            metrics::counter!("llm_calls_total", "model" => model_id.to_string(), "outcome" => kind.label())
                                .increment(1);
                            warn!(
                                model = model_id,
                                key = %credential.label(),
                                kind = kind.label(),
                                error = %error,
                                "LLM call failed"
                            );
                            if kind == FailureKind::QuotaExceeded {
                                self.keys
                                    .mark_exhausted(&credential, policy.quota_cooldown)
                                    .await;
                            }
                            last_failure = Some((kind, error));
                            (RetryEvent::CallFailed(kind), None)
                        }
                    }
                }
            };

            let (next, action) = handle_event(state, event, policy);
            state = next;

            match action {
                RetryAction::Call => {}
                RetryAction::Sleep(delay) => {
                    if pool_exhausted.is_some() {
                        metrics::counter!("llm_pool_waits_total").increment(1);
                        info!(wait_secs = delay.as_secs(), "all keys cooling down, waiting");
                    } else {
                        info!(wait_ms = delay.as_millis() as u64, "backing off before retry");
                    }
                    tokio::time::sleep(delay).await;
                }
                // Success returns from inside the call arm above
                RetryAction::Return | RetryAction::Fail => {
                    return Err(Self::failure(state, pool_exhausted, last_failure));
                }
            }
        }
    }

    fn failure(
        state: RetryState,
        pool_exhausted: Option<QuotaExhausted>,
        last_failure: Option<(FailureKind, CallError)>,
    ) -> RetryError {
        if let Some(exhausted) = pool_exhausted {
            return RetryError::QuotaExhausted(exhausted);
        }
        let attempts = state.calls;
        match last_failure {
            Some((FailureKind::QuotaExceeded, source)) => RetryError::RateLimited { attempts, source },
            Some((FailureKind::Transient, source)) => RetryError::Transient { attempts, source },
            Some((FailureKind::Fatal, source)) => RetryError::Fatal { attempts, source },
            // The machine only fails after a failed call or a pool wait
            None => RetryError::Fatal {
                attempts,
                source: CallError::invalid_response("no call was made"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::KeyPool;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use provider::GenerateFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Generator that replays a fixed script and records every call.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, CallError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, CallError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn keys_used(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
        }

        fn models_used(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
        }
    }

    impl Generator for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        fn generate<'a>(&'a self, api_key: &'a str, model: &'a str, _prompt: &'a str) -> GenerateFuture<'a> {
            self.calls
                .lock()
                .unwrap()
                .push((api_key.to_string(), model.to_string()));
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CallError::http(500, "script exhausted")));
            Box::pin(async move { next })
        }
    }

    fn executor(generator: Arc<Scripted>, keys: &[&str]) -> RetryExecutor {
        let pool = KeyPool::new(keys.iter().map(|k| k.to_string()).collect()).unwrap();
        RetryExecutor::new(generator, Arc::new(RotationManager::new(pool)))
    }

    fn quota() -> Result<String, CallError> {
        Err(CallError::http(429, "RESOURCE_EXHAUSTED: Quota exceeded"))
    }

    #[test]
    fn backoff_grows_and_clamps() {
        let backoff = RetryPolicy::primary(None).backoff;
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(30));
        assert_eq!(backoff.delay(3), Duration::from_secs(90));
        assert_eq!(backoff.delay(4), Duration::from_secs(120));
        assert_eq!(backoff.delay(40), Duration::from_secs(120));
    }

    #[test]
    fn max_calls_counts_fallback() {
        assert_eq!(RetryPolicy::primary(None).max_calls(), 5);
        assert_eq!(RetryPolicy::primary(Some("fb".into())).max_calls(), 6);
        assert_eq!(RetryPolicy::orchestration().max_calls(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn two_quota_errors_then_success_rotates_twice() {
        let generator = Scripted::new(vec![quota(), quota(), Ok("payload".into())]);
        let exec = executor(generator.clone(), &["k1", "k2", "k3"]);
        let start = Instant::now();

        let text = exec
            .call("gemini-primary", "hi", &RetryPolicy::primary(None))
            .await
            .unwrap();

        assert_eq!(text, "payload");
        assert_eq!(generator.keys_used(), vec!["k1", "k2", "k3"]);
        assert_eq!(exec.keys().get_status().await.exhausted_keys, 2);
        assert_eq!(start.elapsed(), Duration::ZERO, "rotation must not sleep");
    }

    #[tokio::test(start_paused = true)]
    async fn non_quota_error_fails_immediately() {
        let generator = Scripted::new(vec![Err(CallError::http(400, "Invalid JSON payload"))]);
        let exec = executor(generator.clone(), &["k1", "k2"]);
        let start = Instant::now();

        let err = exec
            .call("gemini-primary", "hi", &RetryPolicy::primary(Some("fb".into())))
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Fatal { attempts: 1, .. }), "{err:?}");
        assert_eq!(generator.keys_used().len(), 1);
        let status = exec.keys().get_status().await;
        assert_eq!(status.exhausted_keys, 0);
        assert_eq!(status.current_index, 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_backs_off_on_same_key() {
        let generator = Scripted::new(vec![
            Err(CallError::http(503, "UNAVAILABLE")),
            Err(CallError::timeout("no response within 60s")),
            Ok("eventually".into()),
        ]);
        let exec = executor(generator.clone(), &["k1", "k2"]);
        let start = Instant::now();

        let text = exec
            .call("m", "hi", &RetryPolicy::primary(None))
            .await
            .unwrap();

        assert_eq!(text, "eventually");
        assert_eq!(generator.keys_used(), vec!["k1", "k1", "k1"]);
        assert_eq!(start.elapsed(), Duration::from_secs(10 + 30));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_model_gets_exactly_one_attempt() {
        let generator = Scripted::new(vec![quota(), quota(), quota(), Ok("from fallback".into())]);
        let exec = executor(generator.clone(), &["k1", "k2", "k3", "k4"]);

        let text = exec
            .call("primary", "hi", &RetryPolicy::primary(Some("fallback".into())))
            .await
            .unwrap();

        assert_eq!(text, "from fallback");
        assert_eq!(
            generator.models_used(),
            vec!["primary", "primary", "primary", "fallback"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fallback_is_not_retried() {
        let generator = Scripted::new(vec![quota(), quota(), quota(), quota(), Ok("never".into())]);
        let exec = executor(generator.clone(), &["k1", "k2", "k3", "k4", "k5"]);

        let err = exec
            .call("primary", "hi", &RetryPolicy::primary(Some("fallback".into())))
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::RateLimited { attempts: 4, .. }), "{err:?}");
        assert_eq!(generator.keys_used().len(), 4);
        assert!(err.is_quota());
    }

    #[tokio::test(start_paused = true)]
    async fn primary_policy_surfaces_exhausted_pool_with_hint() {
        let generator = Scripted::new(vec![quota(), quota(), quota()]);
        let exec = executor(generator.clone(), &["k1", "k2"]);

        let err = exec
            .call("primary", "hi", &RetryPolicy::primary(Some("fallback".into())))
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::QuotaExhausted(_)), "{err:?}");
        assert_eq!(err.retry_after_secs(), Some(120));
        assert_eq!(generator.keys_used().len(), 2);
        assert!(
            err.to_string().contains("Next key available in 120 seconds"),
            "{err}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn orchestration_policy_waits_for_pool_to_recover() {
        let generator = Scripted::new(vec![quota(), Ok("after wait".into())]);
        let exec = executor(generator.clone(), &["only"]);
        let start = Instant::now();

        let text = exec
            .call("m", "hi", &RetryPolicy::orchestration())
            .await
            .unwrap();

        assert_eq!(text, "after wait");
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(generator.keys_used(), vec!["only", "only"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_pool_wait_reports_the_call_error() {
        let generator = Scripted::new(vec![quota(), Err(CallError::http(400, "bad request"))]);
        let exec = executor(generator.clone(), &["only"]);

        let err = exec
            .call("m", "hi", &RetryPolicy::orchestration())
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Fatal { attempts: 2, .. }), "{err:?}");
        assert_eq!(err.retry_after_secs(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn orchestration_rotation_budget_is_bounded() {
        let generator = Scripted::new((0..10).map(|_| quota()).collect());
        let exec = executor(generator.clone(), &["a", "b", "c", "d", "e", "f"]);

        let err = exec
            .call("m", "hi", &RetryPolicy::orchestration())
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::RateLimited { attempts: 5, .. }), "{err:?}");
        assert_eq!(generator.keys_used(), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_errors_are_bounded() {
        let generator = Scripted::new(Vec::new());
        let exec = executor(generator.clone(), &["k1"]);
        let policy = RetryPolicy::primary(Some("fb".into()));

        let err = exec.call("m", "hi", &policy).await.unwrap_err();

        assert!(matches!(err, RetryError::Transient { attempts: 4, .. }), "{err:?}");
        assert!(generator.keys_used().len() as u32 <= policy.max_calls());
        assert_eq!(generator.models_used().last().map(String::as_str), Some("fb"));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_is_honoured() {
        let generator = Scripted::new(vec![quota(), Ok("unreachable".into())]);
        let pool = KeyPool::new(vec!["k1".into(), "k2".into()]).unwrap();
        let exec = RetryExecutor::with_classifier(
            generator.clone(),
            Arc::new(RotationManager::new(pool)),
            Arc::new(|_: &CallError| FailureKind::Fatal),
        );

        let err = exec
            .call("m", "hi", &RetryPolicy::orchestration())
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Fatal { .. }));
        assert_eq!(exec.keys().get_status().await.exhausted_keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_never_contain_the_key() {
        let generator = Scripted::new(vec![Err(CallError::http(400, "bad request"))]);
        let exec = executor(generator, &["AIzaSyTOP-SECRET"]);

        let err = exec
            .call("m", "hi", &RetryPolicy::primary(None))
            .await
            .unwrap_err();
        assert!(!format!("{err} {err:?}").contains("TOP-SECRET"));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_are_counted_by_outcome() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let generator = Scripted::new(vec![quota(), Ok("ok".into())]);
        let exec = executor(generator, &["k1", "k2"]);
        exec.call("gemini-x", "hi", &RetryPolicy::primary(None))
            .await
            .unwrap();

        let output = handle.render();
        assert!(output.contains(r#"llm_calls_total{model="gemini-x",outcome="success"} 1"#), "{output}");
        assert!(output.contains(r#"outcome="quota_exceeded""#), "{output}");
        assert!(output.contains("llm_key_rotations_total 1"), "{output}");
    }
}
