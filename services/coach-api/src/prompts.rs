//! Prompt templates
//!
//! The unified prompt asks the model to think through all four stages in
//! one reply, marking each with a `[[SECTION]]` delimiter. The stage prompts
//! drive the four-call pipeline and ask for JSON, except clarity which is
//! free text.

use serde_json::{Map, Value};

use crate::opec::ContextMessage;

/// Delimiters the unified reply is split on, in reply order.
pub const OBSERVATION: &str = "[[OBSERVATION]]";
pub const PATTERN: &str = "[[PATTERN]]";
pub const EVALUATION: &str = "[[EVALUATION]]";
pub const CLARITY: &str = "[[CLARITY]]";

/// Context messages included in the unified prompt.
const RECENT_MESSAGES: usize = 5;

/// Characters kept from each context message.
const MESSAGE_PREVIEW_CHARS: usize = 200;

/// Build the single-call prompt for the unified chat path.
///
/// Filled in one pass, so text supplied in the student or market context is
/// inserted verbatim and never expanded again.
pub fn unified(
    message: &str,
    context_messages: &[ContextMessage],
    student_context: &Map<String, Value>,
    market_context: Option<&Value>,
) -> String {
    let market = match market_context {
        Some(data) if !data.is_null() => format!("\nREAL-TIME DATA:\n{}", pretty(data)),
        _ => String::new(),
    };

    let mut prompt = format!(
        "\
You are a career and academic mentor for students. You work through the OPEC \
method before answering: Observe what the student is really asking, detect \
the Pattern behind it, Evaluate it against the real job and education market, \
then reply with Clarity.

STUDENT CONTEXT (personalize every reply with it, never ask for it again):
{student}
{market}

Known patterns: external_pressure, sunk_cost, analysis_paralysis, imposter_syndrome.

Reply in exactly this structure:
{observation}
The core concern and emotional tone in one or two sentences.
{pattern}
Any known pattern names you detect, or \"none\".
{evaluation}
A short, honest reality check.
{clarity}
Your reply to the student: warm, specific, two to four sentences, using their name.",
        student = student_lines(student_context),
        observation = OBSERVATION,
        pattern = PATTERN,
        evaluation = EVALUATION,
        clarity = CLARITY,
    );

    if !context_messages.is_empty() {
        prompt.push_str("\n\nRECENT CONVERSATION:\n");
        let skip = context_messages.len().saturating_sub(RECENT_MESSAGES);
        for msg in &context_messages[skip..] {
            let content: String = msg.content.chars().take(MESSAGE_PREVIEW_CHARS).collect();
            prompt.push_str(&format!("{}: {content}\n", transcript_role(&msg.role)));
        }
    }

    prompt.push_str(&format!("\nUSER MESSAGE: {message}\n\nRESPONSE STARTS HERE:"));
    prompt
}

/// Transcript label for a history role: the student is `USER`, anything
/// else is the model.
fn transcript_role(role: &str) -> &'static str {
    if role.eq_ignore_ascii_case("user") {
        "USER"
    } else {
        "MODEL"
    }
}

/// Stage O: understand the concern behind the message.
pub fn observation(message: &str, student_context: &Map<String, Value>) -> String {
    format!(
        "You are the OBSERVATION AGENT (O). Analyze the user's message deeply.

USER MESSAGE: {message}

STUDENT PROFILE:
{profile}

Output ONLY valid JSON with double quotes and no trailing commas:
{{\"core_concern\": \"summary\", \"emotional_tone\": \"tone\", \"unspoken_needs\": [\"need\"]}}",
        profile = pretty(&Value::Object(student_context.clone())),
    )
}

/// Stage P: score psychological patterns given the observation.
pub fn pattern(message: &str, observation: &Value) -> String {
    format!(
        "You are the PATTERN AGENT (P). Detect psychological patterns based on this analysis.

OBSERVATION:
{observation}

USER MESSAGE: {message}

Detect: external_pressure, sunk_cost, analysis_paralysis, imposter_syndrome, \
internal_conflict, circular_thinking, identity_uncertainty.

Output ONLY valid JSON with double quotes:
{{\"detected_patterns\": {{\"pattern_name\": score_0_to_10}}}}",
        observation = pretty(observation),
    )
}

/// Stage E: market reality check.
pub fn evaluation(message: &str, market_context: Option<&Value>) -> String {
    let data = market_context.map(pretty).unwrap_or_else(|| "{}".to_string());
    format!(
        "You are the EVALUATION AGENT (E). Provide a reality check and market insights.

USER MESSAGE: {message}
MARKET DATA: {data}

Output ONLY valid JSON with double quotes:
{{\"market_insight\": \"key insight\", \"reality_check\": \"honest assessment\"}}"
    )
}

/// Stage C: synthesize the final reply as plain text.
pub fn clarity(
    message: &str,
    student_context: &Map<String, Value>,
    observation: &Value,
    patterns: &Value,
    evaluation: &Value,
) -> String {
    let name = student_context
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or("there");
    format!(
        "You are the CLARITY AGENT (C). Synthesize all insights into a warm, helpful response for {name}.

OBSERVATION: {observation}
PATTERNS: {patterns}
EVALUATION: {evaluation}

USER MESSAGE: {message}

Write a natural response (no JSON). Be a wise mentor."
    )
}

/// Mock interview performance report, returned as JSON.
pub fn interview_report(company: &str, role: &str, duration_seconds: u64) -> String {
    let minutes = minutes_label(duration_seconds);
    format!(
        "You are an expert career coach and interview evaluator giving detailed feedback.

INTERVIEW CONTEXT:
- Company: {company}
- Role: {role}
- Duration: {duration_seconds} seconds ({minutes} minutes)

Write a thorough, specific, encouraging and honest performance report. For a \
{role} position at {company}, consider industry standards and include \
company-specific insights where you can. A {minutes} minute interview sets \
how deep the feedback can go.

Scoring guide: 0-40 fundamentals lacking, 41-55 below expectations, 56-70 \
solid foundation, 71-85 strong with minor refinements, 86-100 exceptional.

Output ONLY valid JSON with double quotes:
{{\"overall_score\": 0-100, \"communication_score\": 0-100, \"technical_score\": 0-100, \
\"confidence_score\": 0-100, \"problem_solving_score\": 0-100, \"cultural_fit_score\": 0-100, \
\"strengths\": [\"four specific strengths\"], \"weaknesses\": [\"three areas with actionable advice\"], \
\"key_insights\": \"3-4 sentences\", \"recommendations\": \"4-5 actionable steps\", \
\"interviewer_notes\": \"2-3 sentences\", \"next_steps\": [\"three action items\"], \
\"estimated_readiness\": \"Interview Ready | Almost There | Keep Practicing | Building Foundation\"}}"
    )
}

/// Minutes to one decimal place, e.g. `300` → `"5.0"`.
pub fn minutes_label(duration_seconds: u64) -> String {
    format!("{:.1}", duration_seconds as f64 / 60.0)
}

/// `key: value` lines for every truthy profile field.
fn student_lines(student_context: &Map<String, Value>) -> String {
    student_context
        .iter()
        .filter(|(_, v)| is_truthy(v))
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}: {s}"),
            other => format!("{k}: {other}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: Value) -> Map<String, Value> {
        pairs.as_object().cloned().unwrap()
    }

    fn msg(role: &str, content: &str) -> ContextMessage {
        ContextMessage {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn unified_lists_only_truthy_profile_fields() {
        let student = ctx(json!({
            "name": "Priya",
            "stream": "PCM",
            "year": 2,
            "location": "",
            "budget": null,
            "interests": [],
        }));
        let prompt = unified("hi", &[], &student, None);

        assert!(prompt.contains("name: Priya"));
        assert!(prompt.contains("stream: PCM"));
        assert!(prompt.contains("year: 2"));
        assert!(!prompt.contains("location:"));
        assert!(!prompt.contains("budget:"));
        assert!(!prompt.contains("interests:"));
        assert!(!prompt.contains("REAL-TIME DATA"));
        assert!(prompt.ends_with("USER MESSAGE: hi\n\nRESPONSE STARTS HERE:"));
    }

    #[test]
    fn unified_keeps_last_five_messages_truncated() {
        let long = "x".repeat(500);
        let history: Vec<ContextMessage> = (0..7)
            .map(|i| msg(if i % 2 == 0 { "user" } else { "assistant" }, &format!("m{i} {long}")))
            .collect();
        let prompt = unified("next", &history, &Map::new(), None);

        assert!(!prompt.contains("m0 "));
        assert!(!prompt.contains("m1 "));
        assert!(prompt.contains("USER: m2 "));
        assert!(prompt.contains("MODEL: m5 "));
        assert!(prompt.contains("USER: m6 "));
        assert!(!prompt.contains(&"x".repeat(200)), "content is cut to 200 chars");
    }

    #[test]
    fn unified_includes_market_data() {
        let market = json!({"openings": 42});
        let prompt = unified("hi", &[], &Map::new(), Some(&market));
        assert!(prompt.contains("REAL-TIME DATA"));
        assert!(prompt.contains("\"openings\": 42"));
    }

    #[test]
    fn unified_inserts_context_text_verbatim() {
        let student = ctx(json!({"goals": "{market_context}", "name": "{student_context}"}));
        let market = json!({"openings": 42, "note": "{student_context}"});
        let prompt = unified("hi", &[], &student, Some(&market));

        assert_eq!(prompt.matches("REAL-TIME DATA").count(), 1);
        assert_eq!(prompt.matches("\"openings\": 42").count(), 1);
        assert!(prompt.contains("goals: {market_context}"));
        assert!(prompt.contains("name: {student_context}"));
    }

    #[test]
    fn history_roles_are_user_or_model() {
        let history = vec![
            msg("user", "first"),
            msg("assistant", "second"),
            msg("system", "third"),
            msg("USER", "fourth"),
        ];
        let prompt = unified("next", &history, &Map::new(), None);

        assert!(prompt.contains("USER: first\n"));
        assert!(prompt.contains("MODEL: second\n"));
        assert!(prompt.contains("MODEL: third\n"));
        assert!(prompt.contains("USER: fourth\n"));
        assert!(!prompt.contains("ASSISTANT:"));
        assert!(!prompt.contains("SYSTEM:"));
    }

    #[test]
    fn unified_declares_all_sections() {
        let prompt = unified("hi", &[], &Map::new(), None);
        for section in [OBSERVATION, PATTERN, EVALUATION, CLARITY] {
            assert!(prompt.contains(section), "{section}");
        }
    }

    #[test]
    fn clarity_addresses_student_by_name() {
        let student = ctx(json!({"name": "Arjun"}));
        let prompt = clarity("help", &student, &json!({}), &json!({}), &json!({}));
        assert!(prompt.contains("response for Arjun."));

        let prompt = clarity("help", &Map::new(), &json!({}), &json!({}), &json!({}));
        assert!(prompt.contains("response for there."));
    }

    #[test]
    fn interview_prompt_embeds_context() {
        let prompt = interview_report("Acme", "Data Analyst", 450);
        assert!(prompt.contains("Company: Acme"));
        assert!(prompt.contains("Role: Data Analyst"));
        assert!(prompt.contains("450 seconds (7.5 minutes)"));
        assert!(prompt.contains("\"overall_score\""));
        assert_eq!(minutes_label(300), "5.0");
    }

    #[test]
    fn stage_prompts_embed_inputs() {
        let student = ctx(json!({"name": "Arjun"}));
        assert!(observation("lost", &student).contains("\"name\": \"Arjun\""));
        assert!(pattern("lost", &json!({"core_concern": "career"})).contains("core_concern"));
        assert!(evaluation("lost", None).contains("MARKET DATA: {}"));
    }
}
