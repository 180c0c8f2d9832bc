//! Gemini `generateContent` client
//!
//! The API key travels in the `x-goog-api-key` header, never in the URL, so
//! reqwest error messages (which include the URL) cannot leak it.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{CallError, GenerateFuture, Generator, ProviderError};

/// Public Gemini API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    /// Concatenate the text parts of the first candidate. Non-text parts
    /// (thought signatures, function calls) are skipped.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

/// Generator backed by the Gemini REST API.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiProvider {
    /// Build a provider for `base_url` with a per-call `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ProviderError::BaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:generateContent", self.base_url)
    }

    #[instrument(skip_all, fields(model = %model))]
    async fn call(&self, api_key: &str, model: &str, prompt: &str) -> Result<String, CallError> {
        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }]
            }]
        });

        let response = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallError::timeout(format!("no response within {}s", self.timeout.as_secs()))
                } else {
                    CallError::transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            debug!(status = status.as_u16(), "generateContent returned error status");
            return Err(CallError::http(status.as_u16(), body));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CallError::timeout("response body not received in time")
            } else {
                CallError::invalid_response(e.to_string())
            }
        })?;

        let text = parsed.text();
        if text.trim().is_empty() {
            return Err(CallError::invalid_response("model returned no text"));
        }
        Ok(text)
    }
}

impl Generator for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    fn generate<'a>(
        &'a self,
        api_key: &'a str,
        model: &'a str,
        prompt: &'a str,
    ) -> GenerateFuture<'a> {
        Box::pin(self.call(api_key, model, prompt))
    }
}
