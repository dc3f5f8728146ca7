//! The `Tool` trait: something the planner can ask for by name.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

pub use crate::error::ToolError;

/// Where a tool call runs.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The `tool_call` job executing the call.
    pub job_id: Uuid,
    /// Id of the call inside its plan.
    pub call_id: String,
    /// Results of the calls this one depends on, by call id.
    pub dependencies: HashMap<String, serde_json::Value>,
}

/// Output of a tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self {
            result,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Upper bound for one execution.
    fn timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{key}' parameter")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_str_reports_missing_key() {
        let params = serde_json::json!({"url": "https://example.com", "n": 3});
        assert_eq!(require_str(&params, "url").unwrap(), "https://example.com");
        assert!(matches!(
            require_str(&params, "n"),
            Err(ToolError::InvalidParameters(_))
        ));
        assert!(require_str(&params, "method").is_err());
    }
}
