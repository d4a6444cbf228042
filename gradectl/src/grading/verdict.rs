//! Structured grader output and malformed-output recovery.
//!
//! Every ensemble run must return a JSON document matching [`GraderVerdict`].
//! Models sometimes wrap that JSON in markdown code fences or leading prose;
//! [`recover_verdict`] salvages those cases so a run is only counted as failed
//! when no usable structure can be extracted at all.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A single grader's complete verdict on an essay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraderVerdict {
    /// Overall score, 0 to 100.
    pub percentage: f64,
    #[serde(default)]
    pub category_scores: Vec<CategoryScore>,
    pub feedback: Feedback,
}

/// Per-rubric-category score, 0 to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub name: String,
    pub score: f64,
}

/// Narrative feedback in the shape shown to students.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub strengths: Vec<FeedbackPoint>,
    #[serde(default)]
    pub improvements: Vec<ImprovementPoint>,
    #[serde(default)]
    pub language_tips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackPoint {
    pub title: String,
    pub description: String,
    /// Direct quote or concrete example from the essay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementPoint {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Parse a grader reply strictly: the content must be the verdict JSON.
pub fn parse_verdict(content: &str) -> Result<GraderVerdict, serde_json::Error> {
    let verdict: GraderVerdict = serde_json::from_str(content)?;
    validate_verdict(&verdict).map_err(serde_json::Error::custom)?;
    Ok(verdict)
}

/// Attempt to salvage a verdict from content that failed strict parsing.
///
/// Strips surrounding whitespace and markdown code fences, then re-parses and
/// validates. Returns `None` when nothing usable can be recovered.
pub fn recover_verdict(raw: &str) -> Option<GraderVerdict> {
    let stripped = strip_code_fences(raw);
    let verdict: GraderVerdict = serde_json::from_str(stripped).ok()?;
    validate_verdict(&verdict).ok()?;
    Some(verdict)
}

/// Salvage variant for the synthesis pass, which returns a bare [`Feedback`].
pub fn parse_feedback(raw: &str) -> Option<Feedback> {
    let stripped = strip_code_fences(raw);
    serde_json::from_str(stripped).ok()
}

fn validate_verdict(verdict: &GraderVerdict) -> Result<(), &'static str> {
    if !verdict.percentage.is_finite() || !(0.0..=100.0).contains(&verdict.percentage) {
        return Err("percentage out of range");
    }
    for category in &verdict.category_scores {
        if !category.score.is_finite() || !(0.0..=100.0).contains(&category.score) {
            return Err("category score out of range");
        }
    }
    Ok(())
}

/// Remove leading/trailing markdown code fences (```json ... ```).
fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string ("json", "JSON", ...) up to the first newline.
        text = match rest.split_once('\n') {
            Some((_, body)) => body,
            None => rest,
        };
        if let Some(body) = text.trim_end().strip_suffix("```") {
            text = body;
        }
        text = text.trim();
    }
    text
}

/// Categorize a malformed reply for operator logs.
pub fn malformed_reason(raw: &str) -> &'static str {
    let text = strip_code_fences(raw);
    if text.is_empty() {
        "unknown"
    } else if text.starts_with('{') && text.contains("\"error\"") && !text.contains("\"feedback\"")
    {
        "api_error"
    } else if text.starts_with('{') && !text.ends_with('}') {
        "truncated_output"
    } else {
        "parse_error"
    }
}

/// JSON schema enforced on grader replies via structured output.
pub fn verdict_schema() -> serde_json::Value {
    json!({
        "name": "grader_verdict",
        "strict": true,
        "schema": {
            "type": "object",
            "properties": {
                "percentage": { "type": "number", "minimum": 0, "maximum": 100 },
                "category_scores": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "score": { "type": "number", "minimum": 0, "maximum": 100 }
                        },
                        "required": ["name", "score"]
                    }
                },
                "feedback": feedback_schema_body()
            },
            "required": ["percentage", "category_scores", "feedback"]
        }
    })
}

/// JSON schema enforced on synthesis replies.
pub fn feedback_schema() -> serde_json::Value {
    json!({
        "name": "synthesized_feedback",
        "strict": true,
        "schema": feedback_schema_body()
    })
}

fn feedback_schema_body() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "strengths": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "description": { "type": "string" },
                        "evidence": { "type": "string" }
                    },
                    "required": ["title", "description"]
                }
            },
            "improvements": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "description": { "type": "string" },
                        "suggestion": { "type": "string" }
                    },
                    "required": ["title", "description"]
                }
            },
            "language_tips": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["strengths", "improvements", "language_tips"]
    })
}
