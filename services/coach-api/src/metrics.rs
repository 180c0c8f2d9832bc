//! Prometheus metrics exposition
//!
//! Service-level metrics:
//!
//! - `http_requests_total` (counter): labels `route`, `status`
//! - `http_request_duration_seconds` (histogram): label `route`
//! - `chat_cache_lookups_total` (counter): label `result`
//!
//! The key pool adds `llm_calls_total`, `llm_key_rotations_total`,
//! `llm_pool_waits_total` and the `llm_keys_available` gauge.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms to 5 minutes. Pipeline requests can sit
/// through several pool waits, so the top buckets are wide.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("http_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed HTTP request.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "http_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("http_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

/// Record a response cache lookup.
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("chat_cache_lookups_total", "result" => result).increment(1);
}
