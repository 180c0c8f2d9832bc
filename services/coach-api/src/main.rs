//! Career Coach API
//!
//! HTTP front for the OPEC mentoring flow:
//! 1. Loads Gemini API keys from the environment into a rotating pool
//! 2. Serves the unified single-call chat, the four-stage pipeline and
//!    mock interview reports
//! 3. Reports key pool health and Prometheus metrics

mod cache;
mod config;
mod error;
mod metrics;
mod opec;
mod prompts;
mod report;

use anyhow::{Context, Result};
use axum::{Json, Router};
use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::{KeyPool, RetryExecutor, RotationManager};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::GeminiProvider;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::{ApiError, ErrorResponse};
use crate::opec::{ChatReply, ChatRequest, Orchestrator};
use crate::report::{InterviewReport, InterviewRequest};

/// How long in-flight requests may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    keys: Arc<RotationManager>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Request metrics are recorded per matched route; the concurrency limit
/// caps in-flight requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/opec/chat", post(opec_chat_handler))
        .route("/api/interviews/report", post(interview_report_handler))
        .route("/api/keys/status", get(keys_status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting career-coach-api");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.llm.base_url,
        primary_model = %config.llm.primary_model,
        fallback_model = config.llm.fallback_model.as_deref().unwrap_or("none"),
        "configuration loaded"
    );

    let pool = KeyPool::from_env(&config.llm.key_env, config.llm.max_numbered_keys)
        .with_context(|| format!("no API keys found in {}", config.llm.key_env))?;

    let generator = GeminiProvider::new(
        &config.llm.base_url,
        Duration::from_secs(config.llm.timeout_secs),
    )
    .context("failed to build Gemini client")?;

    let keys = Arc::new(RotationManager::new(pool));
    let executor = RetryExecutor::new(Arc::new(generator), keys.clone());
    let orchestrator = Orchestrator::new(
        executor,
        config.llm.primary_model.clone(),
        config.llm.fallback_model.clone(),
        config.cache.max_entries,
    );

    let app_state = AppState {
        orchestrator: Arc::new(orchestrator),
        keys,
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Record count and latency for every routed request.
async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    metrics::record_request(
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Unwrap a JSON body, turning a rejection into a validation error.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::Validation(rejection.body_text()))
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Reject malformed bodies and blank messages before any LLM call.
fn validate(payload: Result<Json<ChatRequest>, JsonRejection>) -> Result<ChatRequest, ApiError> {
    let request = json_body(payload)?;
    require("message", &request.message)?;
    Ok(request)
}

/// Unified single-call chat.
#[instrument(skip_all, fields(request_id = tracing::field::Empty))]
async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, ErrorResponse> {
    let request_id = request_id();
    tracing::Span::current().record("request_id", request_id.as_str());

    let request = validate(payload).map_err(|e| e.with_request_id(&request_id))?;
    match state.orchestrator.chat(&request).await {
        Ok(reply) => Ok(Json(reply)),
        Err(err) => {
            warn!(error = %err, "chat failed");
            Err(ApiError::from(err).with_request_id(&request_id))
        }
    }
}

/// Four-stage OPEC pipeline.
#[instrument(skip_all, fields(request_id = tracing::field::Empty))]
async fn opec_chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, ErrorResponse> {
    let request_id = request_id();
    tracing::Span::current().record("request_id", request_id.as_str());

    let request = validate(payload).map_err(|e| e.with_request_id(&request_id))?;
    match state.orchestrator.pipeline(&request).await {
        Ok(reply) => Ok(Json(reply)),
        Err(err) => {
            warn!(error = %err, "pipeline failed");
            Err(ApiError::from(err).with_request_id(&request_id))
        }
    }
}

/// Mock interview performance report.
#[instrument(skip_all, fields(request_id = tracing::field::Empty))]
async fn interview_report_handler(
    State(state): State<AppState>,
    payload: Result<Json<InterviewRequest>, JsonRejection>,
) -> Result<Json<InterviewReport>, ErrorResponse> {
    let request_id = request_id();
    tracing::Span::current().record("request_id", request_id.as_str());

    let request = json_body(payload)
        .and_then(|request| {
            require("company", &request.company)?;
            require("role", &request.role)?;
            Ok(request)
        })
        .map_err(|e| e.with_request_id(&request_id))?;

    match state.orchestrator.interview_report(&request).await {
        Ok(report) => Ok(Json(report)),
        Err(err) => {
            warn!(error = %err, "interview report failed");
            Err(ApiError::from(err).with_request_id(&request_id))
        }
    }
}

/// Key pool snapshot. Never includes key material.
async fn keys_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.keys.get_status().await)
}

/// Health endpoint: 200 while at least one key is usable, 503 when every
/// key is cooling down.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let keys = state.keys.get_status().await;
    let status = keys.health_label();
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = serde_json::json!({
        "status": status,
        "keys": keys,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });

    (
        code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
