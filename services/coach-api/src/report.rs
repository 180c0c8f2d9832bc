//! Mock interview performance reports
//!
//! The model is asked for a JSON report. A reply missing any required field,
//! or with a required field of the wrong shape, is replaced by a fixed
//! report derived from the interview length. Scores are clamped to 0..=100.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::prompts::minutes_label;

/// Fields a model report must carry to be used.
pub const REQUIRED_FIELDS: [&str; 8] = [
    "overall_score",
    "communication_score",
    "technical_score",
    "confidence_score",
    "strengths",
    "weaknesses",
    "key_insights",
    "recommendations",
];

/// Body of `POST /api/interviews/report`.
#[derive(Debug, Clone, Deserialize)]
pub struct InterviewRequest {
    pub company: String,
    pub role: String,
    #[serde(default)]
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterviewReport {
    pub overall_score: u32,
    pub communication_score: u32,
    pub technical_score: u32,
    pub confidence_score: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem_solving_score: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cultural_fit_score: Option<u32>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub key_insights: String,
    pub recommendations: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interviewer_notes: Option<String>,
    pub next_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_readiness: Option<String>,
}

/// Why a model report was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {0} has the wrong type")]
    InvalidField(&'static str),
}

/// Validate and normalize a report object pulled from model output.
pub fn parse_report(raw: &Map<String, Value>) -> Result<InterviewReport, ReportError> {
    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !raw.contains_key(**f)) {
        return Err(ReportError::MissingField(*missing));
    }

    let required_score = |field: &'static str| {
        raw.get(field)
            .and_then(score)
            .ok_or(ReportError::InvalidField(field))
    };
    let required_text = |field: &'static str| {
        raw.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ReportError::InvalidField(field))
    };
    let list = |field: &'static str| -> Result<Vec<String>, ReportError> {
        match raw.get(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()),
            Some(_) => Err(ReportError::InvalidField(field)),
        }
    };
    let optional_text = |field: &str| raw.get(field).and_then(Value::as_str).map(str::to_string);

    let mut strengths = list("strengths")?;
    if strengths.is_empty() {
        strengths.push("Completed the interview session".to_string());
    }
    let mut weaknesses = list("weaknesses")?;
    if weaknesses.is_empty() {
        weaknesses.push("More practice recommended".to_string());
    }

    Ok(InterviewReport {
        overall_score: required_score("overall_score")?,
        communication_score: required_score("communication_score")?,
        technical_score: required_score("technical_score")?,
        confidence_score: required_score("confidence_score")?,
        problem_solving_score: raw.get("problem_solving_score").and_then(score),
        cultural_fit_score: raw.get("cultural_fit_score").and_then(score),
        strengths,
        weaknesses,
        key_insights: required_text("key_insights")?,
        recommendations: required_text("recommendations")?,
        interviewer_notes: optional_text("interviewer_notes"),
        next_steps: list("next_steps").unwrap_or_default(),
        estimated_readiness: optional_text("estimated_readiness"),
    })
}

/// A number, or a numeric string, clamped to 0..=100 and truncated.
fn score(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.clamp(0.0, 100.0) as u32)
}

/// Report used when the model cannot produce one. Longer sessions score a
/// little higher, capped at 85.
pub fn fallback_report(company: &str, role: &str, duration_seconds: u64) -> InterviewReport {
    let base = (60 + duration_seconds / 10).min(85) as u32;
    let minutes = minutes_label(duration_seconds);

    InterviewReport {
        overall_score: base,
        communication_score: base + 5,
        technical_score: base - 5,
        confidence_score: base,
        problem_solving_score: Some(base - 2),
        cultural_fit_score: Some(base + 3),
        strengths: vec![
            format!("Demonstrated initiative by practicing for the {role} position at {company}"),
            "Showed commitment to professional development through consistent preparation".into(),
            "Engaged actively in the mock interview session".into(),
            "Willingness to receive and act on feedback".into(),
        ],
        weaknesses: vec![
            "Consider structuring answers using the STAR method (Situation, Task, Action, Result) for behavioral questions".into(),
            "Work on providing more specific, quantifiable examples from past experiences".into(),
            "Practice elaborating on technical concepts with clear, concise explanations".into(),
        ],
        key_insights: format!(
            "Great effort completing a {minutes}-minute mock interview for the {role} position at {company}. \
             This session demonstrates your commitment to preparation. Consistent practice will help \
             build confidence and refine your responses."
        ),
        recommendations: format!(
            "To strengthen your candidacy for {role} at {company}: 1) Research the company culture and \
             recent news, 2) Prepare 3-5 specific examples from your experience that align with the role \
             requirements, 3) Practice explaining technical concepts simply, 4) Record yourself to \
             identify verbal fillers and pacing issues."
        ),
        interviewer_notes: Some(format!(
            "The candidate showed genuine interest in the {role} position. With continued practice \
             and preparation, there is strong potential for improvement."
        )),
        next_steps: vec![
            format!("Research {company}'s mission, values, and recent developments"),
            "Prepare specific examples using the STAR method".into(),
            "Practice with additional mock interviews to build confidence".into(),
        ],
        estimated_readiness: Some(
            if base < 70 { "Keep Practicing" } else { "Almost There" }.to_string(),
        ),
    }
}
