//! `tool_call` work jobs: run one planned tool call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::{HandlerError, ToolError};
use crate::jobs::config::JobConfig;
use crate::orchestrator::tool_job_id;
use crate::tools::{ToolContext, ToolRegistry};
use crate::worker::{WorkContext, WorkHandler, WorkOutput};

pub struct ToolCallHandler {
    tools: Arc<ToolRegistry>,
}

impl ToolCallHandler {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl WorkHandler for ToolCallHandler {
    fn job_type(&self) -> &'static str {
        "tool_call"
    }

    async fn run(&self, ctx: &WorkContext) -> Result<WorkOutput, HandlerError> {
        let job = &ctx.record.job;
        let JobConfig::ToolCall(call) = &job.config else {
            return Err(HandlerError::Terminal(format!(
                "job {} is not a tool_call job",
                job.id
            )));
        };
        let step_id = job
            .parent_id
            .ok_or_else(|| HandlerError::Terminal("tool call has no parent step".to_string()))?;

        let tool = self
            .tools
            .get(&call.tool)
            .await
            .ok_or_else(|| ToolError::NotFound(call.tool.clone()))?;

        // Dependencies are terminal by the time a call is spawned. A failed
        // dependency shows up as null.
        let mut dependencies = HashMap::new();
        for dep in &call.depends_on {
            let record = ctx
                .runtime
                .store
                .get_job(tool_job_id(step_id, call.round, dep))
                .await?;
            let result = record
                .and_then(|r| r.state.result)
                .and_then(|r| r.get("result").cloned())
                .unwrap_or(serde_json::Value::Null);
            dependencies.insert(dep.clone(), result);
        }

        let tool_ctx = ToolContext {
            job_id: job.id,
            call_id: call.call_id.clone(),
            dependencies,
        };
        let timeout = tool.timeout();
        let output =
            match tokio::time::timeout(timeout, tool.execute(call.params.clone(), &tool_ctx)).await {
                Ok(result) => result?,
                Err(_) => return Err(ToolError::Timeout(timeout).into()),
            };

        info!(
            job_id = %job.id,
            tool = %call.tool,
            call_id = %call.call_id,
            duration_ms = output.duration_ms,
            "Tool call finished"
        );
        Ok(WorkOutput::with_result(
            json!({
                "tool": call.tool,
                "call_id": call.call_id,
                "result": output.result,
                "duration_ms": output.duration_ms,
            }),
            1,
        ))
    }
}
