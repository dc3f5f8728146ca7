//! Planning: ask the model for tool calls and validate what comes back.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::PlanError;
use crate::llm::{ChatMessage, ToolDefinition};

/// Name of the forced output tool for planning.
pub const EMIT_PLAN: &str = "emit_plan";

const PLANNER_RULES: &str = "You are a planner. You have no external knowledge: every fact must \
come from the tools listed below. Respond only by calling emit_plan. Either return at least one \
tool call, or return an error explaining why the goal cannot be reached with these tools. Never \
answer in prose and never invent data.";

/// One tool call proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    calls: Vec<PlannedCall>,
    #[serde(default)]
    error: Option<String>,
}

/// Output schema of the planner.
pub fn plan_tool() -> ToolDefinition {
    ToolDefinition {
        name: EMIT_PLAN.to_string(),
        description: "Emit the tool calls needed to reach the goal, or an error.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "calls": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string", "description": "Unique id of this call"},
                            "tool": {"type": "string", "description": "Name of an available tool"},
                            "params": {"type": "object", "description": "Tool parameters"},
                            "depends_on": {
                                "type": "array",
                                "items": {"type": "string"},
                                "description": "Ids of calls whose results this call needs"
                            }
                        },
                        "required": ["id", "tool", "params"]
                    }
                },
                "error": {
                    "type": "string",
                    "description": "Why no plan is possible with the available tools"
                }
            }
        }),
    }
}

/// Prompt for one planning round. `context` carries what earlier rounds
/// learned.
pub fn planning_messages(
    goal: &str,
    tools: &[ToolDefinition],
    context: &[String],
    round: u32,
) -> Vec<ChatMessage> {
    let catalog: Vec<_> = tools
        .iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters }))
        .collect();
    let catalog = serde_json::to_string_pretty(&catalog).unwrap_or_else(|_| "[]".to_string());

    let mut prompt = format!("Goal: {goal}\n\nAvailable tools:\n{catalog}\n");
    if !context.is_empty() {
        prompt.push_str(&format!(
            "\nThis is round {}. Earlier rounds found:\n- {}\n",
            round + 1,
            context.join("\n- ")
        ));
    }
    vec![ChatMessage::system(PLANNER_RULES), ChatMessage::user(prompt)]
}

/// Parse and validate planner output against the allowed tools.
pub fn parse_plan(args: &serde_json::Value, allowed: &[String]) -> Result<Vec<PlannedCall>, PlanError> {
    let raw: RawPlan = serde_json::from_value(args.clone()).map_err(|e| PlanError::Malformed {
        phase: "planning".to_string(),
        reason: e.to_string(),
    })?;

    if let Some(error) = raw.error.filter(|e| !e.trim().is_empty()) {
        return Err(PlanError::NoActionablePlan(error));
    }
    if raw.calls.is_empty() {
        return Err(PlanError::NoActionablePlan(
            "planner returned no tool calls".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for call in &raw.calls {
        if call.id.trim().is_empty() || !ids.insert(call.id.as_str()) {
            return Err(PlanError::Malformed {
                phase: "planning".to_string(),
                reason: format!("missing or duplicate call id '{}'", call.id),
            });
        }
        if !allowed.iter().any(|t| t == &call.tool) {
            return Err(PlanError::UnknownTool {
                tool: call.tool.clone(),
            });
        }
    }
    for call in &raw.calls {
        for dep in &call.depends_on {
            if dep == &call.id || !ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    call: call.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    check_acyclic(&raw.calls)?;

    Ok(raw.calls)
}

/// Kahn's algorithm; whatever cannot be ordered sits on a cycle.
fn check_acyclic(calls: &[PlannedCall]) -> Result<(), PlanError> {
    let mut indegree: HashMap<&str, usize> = calls
        .iter()
        .map(|c| (c.id.as_str(), c.depends_on.len()))
        .collect();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut ordered = 0;

    while let Some(id) = ready.pop() {
        ordered += 1;
        for call in calls.iter().filter(|c| c.depends_on.iter().any(|d| d == id)) {
            if let Some(d) = indegree.get_mut(call.id.as_str()) {
                *d -= 1;
                if *d == 0 {
                    ready.push(call.id.as_str());
                }
            }
        }
    }

    if ordered == calls.len() {
        return Ok(());
    }
    let stuck = calls
        .iter()
        .find(|c| indegree.get(c.id.as_str()).is_some_and(|d| *d > 0))
        .map(|c| c.id.clone())
        .unwrap_or_default();
    Err(PlanError::Cycle { call: stuck })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["fetch_price".to_string(), "http_fetch".to_string()]
    }

    #[test]
    fn zero_calls_is_not_actionable() {
        let err = parse_plan(&json!({"calls": []}), &allowed()).unwrap_err();
        assert!(err.to_string().starts_with("no actionable plan"));
    }

    #[test]
    fn error_object_is_not_actionable() {
        let err = parse_plan(&json!({"error": "no tool returns stock prices"}), &allowed())
            .unwrap_err();
        assert_eq!(err.to_string(), "no actionable plan: no tool returns stock prices");
    }

    #[test]
    fn accepts_valid_dependent_calls() {
        let calls = parse_plan(
            &json!({"calls": [
                {"id": "a", "tool": "fetch_price", "params": {"ticker": "ACME"}},
                {"id": "b", "tool": "http_fetch", "params": {"url": "https://example.com"}, "depends_on": ["a"]}
            ]}),
            &allowed(),
        )
        .unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].depends_on, vec!["a"]);
    }

    #[test]
    fn rejects_unknown_tool() {
        let err = parse_plan(
            &json!({"calls": [{"id": "a", "tool": "shell", "params": {}}]}),
            &allowed(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownTool { tool } if tool == "shell"));
    }

    #[test]
    fn rejects_self_and_unknown_dependencies() {
        let err = parse_plan(
            &json!({"calls": [{"id": "a", "tool": "fetch_price", "params": {}, "depends_on": ["a"]}]}),
            &allowed(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));

        let err = parse_plan(
            &json!({"calls": [{"id": "a", "tool": "fetch_price", "params": {}, "depends_on": ["zzz"]}]}),
            &allowed(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { dependency, .. } if dependency == "zzz"));
    }

    #[test]
    fn rejects_cycles() {
        let err = parse_plan(
            &json!({"calls": [
                {"id": "a", "tool": "fetch_price", "params": {}, "depends_on": ["c"]},
                {"id": "b", "tool": "fetch_price", "params": {}, "depends_on": ["a"]},
                {"id": "c", "tool": "fetch_price", "params": {}, "depends_on": ["b"]},
                {"id": "d", "tool": "fetch_price", "params": {}}
            ]}),
            &allowed(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::Cycle { .. }));
    }

    #[test]
    fn prompt_includes_earlier_findings() {
        let messages = planning_messages(
            "price of ACME stock",
            &[plan_tool()],
            &["fetch_price returned 404".to_string()],
            1,
        );
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("round 2"));
        assert!(messages[1].content.contains("fetch_price returned 404"));
    }
}
