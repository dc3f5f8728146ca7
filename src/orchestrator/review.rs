//! Review: judge whether the tool results reach the goal.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::PlanError;
use crate::jobs::model::truncate;
use crate::llm::{ChatMessage, ToolDefinition};

/// Name of the forced output tool for review.
pub const EMIT_REVIEW: &str = "emit_review";

/// Per-call result text sent to the reviewer is capped at this many bytes.
const MAX_RESULT_CHARS: usize = 4000;

const REVIEWER_RULES: &str = "You review the results of tool calls made to reach a goal. Judge \
only from the results given. Respond only by calling emit_review. If the goal is not met, list \
the missing data and concrete recovery actions another planning round could take.";

/// How one planned call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub call_id: String,
    pub tool: String,
    /// Job status, or `not_run` when the call never started.
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub goal_achieved: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub missing_data: Vec<String>,
    #[serde(default)]
    pub recovery_actions: Vec<String>,
}

impl Review {
    /// Another plan/execute/review round is worth it.
    pub fn wants_replan(&self, round: u32, max_rounds: u32) -> bool {
        !self.goal_achieved && !self.recovery_actions.is_empty() && round + 1 < max_rounds
    }

    /// One-line digest handed to the next planning round.
    pub fn digest(&self, round: u32) -> String {
        let mut line = format!("round {} review: {}", round + 1, self.summary);
        if !self.missing_data.is_empty() {
            line.push_str(&format!("; missing: {}", self.missing_data.join(", ")));
        }
        if !self.recovery_actions.is_empty() {
            line.push_str(&format!("; try: {}", self.recovery_actions.join(", ")));
        }
        line
    }
}

/// Output schema of the reviewer.
pub fn review_tool() -> ToolDefinition {
    ToolDefinition {
        name: EMIT_REVIEW.to_string(),
        description: "Emit the verdict on whether the goal was achieved.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "goal_achieved": {"type": "boolean"},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "summary": {"type": "string"},
                "missing_data": {"type": "array", "items": {"type": "string"}},
                "recovery_actions": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["goal_achieved", "confidence", "summary"]
        }),
    }
}

pub fn review_messages(goal: &str, outcomes: &[CallOutcome]) -> Vec<ChatMessage> {
    let results: Vec<_> = outcomes
        .iter()
        .map(|o| {
            let result = o
                .result
                .as_ref()
                .map(|r| truncate(&r.to_string(), MAX_RESULT_CHARS));
            json!({
                "call": o.call_id,
                "tool": o.tool,
                "status": o.status,
                "result": result,
                "error": o.error,
            })
        })
        .collect();
    let results = serde_json::to_string_pretty(&results).unwrap_or_else(|_| "[]".to_string());
    vec![
        ChatMessage::system(REVIEWER_RULES),
        ChatMessage::user(format!("Goal: {goal}\n\nTool results:\n{results}")),
    ]
}

pub fn parse_review(args: &serde_json::Value) -> Result<Review, PlanError> {
    let mut review: Review =
        serde_json::from_value(args.clone()).map_err(|e| PlanError::Malformed {
            phase: "review".to_string(),
            reason: e.to_string(),
        })?;
    review.confidence = review.confidence.clamp(0.0, 1.0);
    Ok(review)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(achieved: bool, actions: &[&str]) -> Review {
        Review {
            goal_achieved: achieved,
            confidence: 0.5,
            summary: "partial".into(),
            missing_data: vec!["dividends".into()],
            recovery_actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn replans_only_when_useful_and_rounds_remain() {
        assert!(review(false, &["fetch dividends"]).wants_replan(0, 2));
        assert!(!review(false, &["fetch dividends"]).wants_replan(1, 2));
        assert!(!review(false, &[]).wants_replan(0, 2));
        assert!(!review(true, &["fetch dividends"]).wants_replan(0, 2));
    }

    #[test]
    fn parse_clamps_confidence_and_requires_verdict() {
        let r = parse_review(&json!({"goal_achieved": true, "confidence": 3.0, "summary": "ok"}))
            .unwrap();
        assert_eq!(r.confidence, 1.0);
        assert!(r.missing_data.is_empty());

        assert!(parse_review(&json!({"summary": "no verdict"})).is_err());
    }

    #[test]
    fn digest_mentions_missing_data() {
        let line = review(false, &["fetch dividends"]).digest(0);
        assert!(line.contains("missing: dividends"));
        assert!(line.contains("try: fetch dividends"));
    }
}
