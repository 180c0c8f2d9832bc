//! OPEC prompt orchestration
//!
//! Two ways through the same Observation → Pattern → Evaluation → Clarity
//! method:
//!
//! - `Orchestrator::chat`: one LLM call with the unified prompt, reply split
//!   on `[[SECTION]]` delimiters, successful replies cached
//! - `Orchestrator::pipeline`: four calls, O → (P ∥ E) → C, each stage
//!   falling back to a neutral default on failure
//!
//! `Orchestrator::interview_report` uses the same retrying client for mock
//! interview reports.
//!
//! Quota conditions are never degraded: they propagate so the client gets a
//! 429 with retry timing.

use std::collections::BTreeMap;

use key_pool::{RetryError, RetryExecutor, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::cache::ResponseCache;
use crate::prompts;
use crate::report::{self, InterviewReport, InterviewRequest};

/// Pattern names recognized in the unified reply's pattern section.
pub const KNOWN_PATTERNS: &[&str] = &[
    "external_pressure",
    "sunk_cost",
    "analysis_paralysis",
    "imposter_syndrome",
];

/// Reply when the clarity stage cannot produce text.
pub const CLARITY_FALLBACK: &str =
    "I'm having a bit of trouble thinking clearly right now, but I'm here to listen.";

/// Stage names reported by the pipeline.
const AGENTS: [&str; 4] = ["observation", "pattern", "evaluation", "clarity"];

fn default_role() -> String {
    "user".to_string()
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Body of both chat endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub context_messages: Vec<ContextMessage>,
    #[serde(default)]
    pub student_context: Map<String, Value>,
    #[serde(default)]
    pub market_context: Option<Value>,
}

/// Intermediate stage output shown alongside the reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Thinking {
    pub observation: String,
    pub pattern: String,
    pub evaluation: String,
}

/// Response of both chat endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub thinking: Thinking,
    pub patterns: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents_used: Option<Vec<&'static str>>,
}

/// Sections split out of a unified reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Sections {
    pub thinking: Thinking,
    /// Text after `[[CLARITY]]`, or the whole reply when the marker is missing
    pub response: String,
}

/// Split a unified reply on its section markers.
///
/// Each section runs to the next marker that follows it. A missing section
/// is empty.
pub fn parse_sections(raw: &str) -> Sections {
    let section = |marker: &str, ends: &[&str]| -> String {
        let Some((_, rest)) = raw.split_once(marker) else {
            return String::new();
        };
        ends.iter()
            .find_map(|end| rest.split_once(end).map(|(body, _)| body.trim().to_string()))
            .unwrap_or_default()
    };

    let thinking = Thinking {
        observation: section(
            prompts::OBSERVATION,
            &[prompts::PATTERN, prompts::EVALUATION, prompts::CLARITY],
        ),
        pattern: section(prompts::PATTERN, &[prompts::EVALUATION, prompts::CLARITY]),
        evaluation: section(prompts::EVALUATION, &[prompts::CLARITY]),
    };

    let response = match raw.split_once(prompts::CLARITY) {
        Some((_, clarity)) => {
            // A repeated marker ends the section
            let clarity = clarity.split(prompts::CLARITY).next().unwrap_or_default();
            clarity.trim().to_string()
        }
        None => raw.to_string(),
    };

    Sections { thinking, response }
}

/// Known pattern names mentioned in `pattern_section`, case-insensitively.
pub fn detect_patterns(pattern_section: &str) -> BTreeMap<String, f64> {
    let lower = pattern_section.to_lowercase();
    KNOWN_PATTERNS
        .iter()
        .filter(|p| lower.contains(*p))
        .map(|p| (p.to_string(), 1.0))
        .collect()
}

/// Pull a JSON object out of model text.
///
/// Tries a ```json fence, then any ``` fence, then the outermost braces.
/// Anything unparseable, or parseable but not an object, yields an empty
/// object.
pub fn extract_json(text: &str) -> Map<String, Value> {
    let mut body = text.trim();
    if body.is_empty() {
        return Map::new();
    }

    if let Some((_, rest)) = body.split_once("```json") {
        body = rest.split("```").next().unwrap_or_default().trim();
    } else if let Some((_, rest)) = body.split_once("```") {
        body = rest.split("```").next().unwrap_or_default().trim();
    }

    if !(body.starts_with('{') && body.ends_with('}')) {
        if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
            if start < end {
                body = &body[start..=end];
            }
        }
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            debug!(preview = %body.chars().take(100).collect::<String>(), "no JSON object in model output");
            Map::new()
        }
    }
}

/// Runs the OPEC method against the retrying LLM client.
pub struct Orchestrator {
    executor: RetryExecutor,
    primary_model: String,
    fallback_model: Option<String>,
    cache: ResponseCache<ChatReply>,
}

impl Orchestrator {
    pub fn new(
        executor: RetryExecutor,
        primary_model: String,
        fallback_model: Option<String>,
        cache_entries: usize,
    ) -> Self {
        Self {
            executor,
            primary_model,
            fallback_model,
            cache: ResponseCache::new(cache_entries),
        }
    }

    /// Single-call chat with the unified prompt.
    #[instrument(skip_all)]
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, RetryError> {
        let key = cache_key(request);
        if let Some(hit) = self.cache.get(&key).await {
            debug!("returning cached response");
            return Ok(hit);
        }

        let prompt = prompts::unified(
            &request.message,
            &request.context_messages,
            &request.student_context,
            request.market_context.as_ref(),
        );
        let policy = RetryPolicy::primary(self.fallback_model.clone());
        let raw = self
            .executor
            .call(&self.primary_model, &prompt, &policy)
            .await?;

        let sections = parse_sections(&raw);
        if !raw.contains(prompts::CLARITY) {
            warn!("structured sections missing from reply, returning raw text");
        }
        let reply = ChatReply {
            patterns: detect_patterns(&sections.thinking.pattern),
            response: sections.response,
            thinking: sections.thinking,
            agents_used: None,
        };

        self.cache.insert(key, reply.clone()).await;
        Ok(reply)
    }

    /// Four-call pipeline: observation, then pattern and evaluation
    /// concurrently, then clarity.
    #[instrument(skip_all)]
    pub async fn pipeline(&self, request: &ChatRequest) -> Result<ChatReply, RetryError> {
        let policy = RetryPolicy::orchestration();
        let message = request.message.as_str();

        let observation = self
            .stage_json("observation", &prompts::observation(message, &request.student_context), &policy)
            .await?;
        let observation = if observation.is_empty() {
            json!({"core_concern": message, "emotional_tone": "neutral"})
        } else {
            Value::Object(observation)
        };

        let pattern_prompt = prompts::pattern(message, &observation);
        let evaluation_prompt = prompts::evaluation(message, request.market_context.as_ref());
        let (pattern, evaluation) = tokio::join!(
            self.stage_json("pattern", &pattern_prompt, &policy),
            self.stage_json("evaluation", &evaluation_prompt, &policy),
        );
        let patterns = pattern?
            .get("detected_patterns")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let patterns = Value::Object(patterns);
        let evaluation = Value::Object(evaluation?);

        let clarity_prompt = prompts::clarity(
            message,
            &request.student_context,
            &observation,
            &patterns,
            &evaluation,
        );
        let response = match self.stage("clarity", &clarity_prompt, &policy).await? {
            Some(text) if !text.trim().is_empty() => text,
            _ => CLARITY_FALLBACK.to_string(),
        };

        Ok(ChatReply {
            response,
            thinking: Thinking {
                observation: observation.to_string(),
                pattern: patterns.to_string(),
                evaluation: evaluation.to_string(),
            },
            patterns: numeric_scores(&patterns),
            agents_used: Some(AGENTS.to_vec()),
        })
    }

    /// Interview performance report. Any non-quota failure, or a reply that
    /// is not a usable report, yields the fixed fallback report.
    #[instrument(skip_all, fields(company = %request.company, role = %request.role))]
    pub async fn interview_report(
        &self,
        request: &InterviewRequest,
    ) -> Result<InterviewReport, RetryError> {
        let fallback =
            || report::fallback_report(&request.company, &request.role, request.duration_seconds);
        let prompt =
            prompts::interview_report(&request.company, &request.role, request.duration_seconds);

        let Some(text) = self
            .stage("interview_report", &prompt, &RetryPolicy::orchestration())
            .await?
        else {
            return Ok(fallback());
        };

        match report::parse_report(&extract_json(&text)) {
            Ok(parsed) => {
                info!("generated interview report");
                Ok(parsed)
            }
            Err(err) => {
                warn!(error = %err, "unusable interview report, using fallback");
                Ok(fallback())
            }
        }
    }

    /// One pipeline call. Quota conditions propagate; other failures are
    /// logged and reported as `None` so the stage can use its default.
    async fn stage(
        &self,
        name: &'static str,
        prompt: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<String>, RetryError> {
        match self.executor.call(&self.primary_model, prompt, policy).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.is_quota() => Err(err),
            Err(err) => {
                warn!(stage = name, error = %err, "stage failed, using default");
                Ok(None)
            }
        }
    }

    async fn stage_json(
        &self,
        name: &'static str,
        prompt: &str,
        policy: &RetryPolicy,
    ) -> Result<Map<String, Value>, RetryError> {
        Ok(self
            .stage(name, prompt, policy)
            .await?
            .map(|text| extract_json(&text))
            .unwrap_or_default())
    }
}

fn cache_key(request: &ChatRequest) -> String {
    let history = serde_json::to_string(&request.context_messages).unwrap_or_default();
    let student = serde_json::to_string(&request.student_context).unwrap_or_default();
    let market = request
        .market_context
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    ResponseCache::<ChatReply>::key(&request.message, &[&history, &student, &market])
}

fn numeric_scores(patterns: &Value) -> BTreeMap<String, f64> {
    patterns
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(name, score)| score.as_f64().map(|s| (name.clone(), s)))
                .collect()
        })
        .unwrap_or_default()
}
