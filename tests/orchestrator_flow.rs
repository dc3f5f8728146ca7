//! Orchestrate steps driven end to end with a scripted LLM.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use jobweave::error::LlmError;
use jobweave::jobs::config::JobConfig;
use jobweave::jobs::{JobStatus, child_id};
use jobweave::llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse,
};
use jobweave::tools::{Tool, ToolContext, ToolError, ToolOutput, ToolRegistry};

use common::*;

/// Answers forced-tool requests from per-tool scripts, in order.
struct ScriptedLlm {
    plans: Mutex<VecDeque<Value>>,
    reviews: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(plans: Vec<Value>, reviews: Vec<Value>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            reviews: Mutex::new(reviews.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        unimplemented!("orchestrator only uses forced tool calls")
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let tool = request.force_tool.clone().unwrap_or_default();
        self.calls.lock().unwrap().push(tool.clone());
        let script = match tool.as_str() {
            "emit_plan" => &self.plans,
            "emit_review" => &self.reviews,
            other => panic!("unexpected forced tool {other}"),
        };
        let arguments = script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("script for {tool} ran out"));
        Ok(ToolCompletionResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: "toolu_1".into(),
                name: tool,
                arguments,
            }],
            input_tokens: 10,
            output_tokens: 10,
            finish_reason: FinishReason::ToolUse,
        })
    }
}

/// Returns a price, plus whatever its dependencies produced.
struct PriceTool;

#[async_trait]
impl Tool for PriceTool {
    fn name(&self) -> &str {
        "fetch_price"
    }

    fn description(&self) -> &str {
        "Look up the latest price for a ticker"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"ticker": {"type": "string"}}, "required": ["ticker"]})
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let ticker = jobweave::tools::require_str(&params, "ticker")?;
        Ok(ToolOutput::success(
            json!({ "ticker": ticker, "price": 42.5, "inputs": ctx.dependencies }),
            Duration::from_millis(1),
        ))
    }
}

/// Takes far longer than any step in these tests is allowed to run.
struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow_report"
    }

    fn description(&self) -> &str {
        "Compile a long report"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        tokio::time::sleep(Duration::from_secs(4)).await;
        Ok(ToolOutput::success(json!({"report": "done"}), Duration::from_secs(4)))
    }
}

fn tools() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new();
    registry.register_sync(Arc::new(PriceTool));
    registry.register_sync(Arc::new(SlowTool));
    Arc::new(registry)
}

fn research_definition() -> jobweave::jobs::JobDefinition {
    definition(json!({
        "id": "research",
        "name": "Research",
        "steps": [{
            "name": "answer",
            "action": "orchestrate",
            "goal": "What is ACME trading at, compared to its peer?",
            "tools": ["fetch_price"],
            "max_rounds": 2
        }]
    }))
}

#[tokio::test]
async fn zero_call_plan_fails_the_step() {
    let llm = Arc::new(ScriptedLlm::new(vec![json!({"calls": []})], vec![]));
    let engine = engine(
        backend().await,
        Arc::new(FakeFetcher::default()),
        Some(llm.clone()),
        tools(),
    );
    engine.executor.save_definition(&research_definition()).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("research").await.unwrap();
    let manager = wait_terminal(&engine, manager_id).await;
    assert_eq!(manager.status(), JobStatus::Failed);

    let step = engine
        .runtime
        .load(child_id(manager_id, "step:0:answer"))
        .await
        .unwrap();
    assert_eq!(step.status(), JobStatus::Failed);
    let error = step.state.error.clone().unwrap_or_default();
    assert!(error.starts_with("no actionable plan"), "{error}");
    assert_eq!(step.state.metadata["error_code"], "planning_failed");
    assert!(
        manager
            .state
            .error
            .as_deref()
            .is_some_and(|e| e.contains("no actionable plan"))
    );

    // No tool jobs were created and the reviewer was never asked.
    let children = engine.runtime.store.list_children(step.id()).await.unwrap();
    assert!(
        children
            .iter()
            .all(|c| !matches!(c.job.config, JobConfig::ToolCall(_)))
    );
    assert_eq!(llm.calls(), vec!["emit_plan"]);

    engine.stop().await;
}

#[tokio::test]
async fn plan_execute_review_with_dependencies() {
    let llm = Arc::new(ScriptedLlm::new(
        vec![json!({"calls": [
            {"id": "acme", "tool": "fetch_price", "params": {"ticker": "ACME"}},
            {"id": "peer", "tool": "fetch_price", "params": {"ticker": "PEER"}, "depends_on": ["acme"]}
        ]})],
        vec![json!({
            "goal_achieved": true,
            "confidence": 0.9,
            "summary": "ACME at 42.5, same as its peer"
        })],
    ));
    let engine = engine(
        backend().await,
        Arc::new(FakeFetcher::default()),
        Some(llm.clone()),
        tools(),
    );
    engine.executor.save_definition(&research_definition()).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("research").await.unwrap();
    let manager = wait_terminal(&engine, manager_id).await;
    assert_eq!(manager.status(), JobStatus::Completed, "{:?}", manager.state.error);

    let step = engine
        .runtime
        .load(child_id(manager_id, "step:0:answer"))
        .await
        .unwrap();
    assert_eq!(step.status(), JobStatus::Completed);
    let result = step.state.result.clone().unwrap();
    assert_eq!(result["rounds"], 1);
    assert_eq!(result["review"]["goal_achieved"], true);
    assert_eq!(step.state.result_count, 2);

    let results = result["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r["status"] == "completed"));
    // The dependent call saw the result of the call it waited for.
    let peer = results.iter().find(|r| r["call_id"] == "peer").unwrap();
    assert_eq!(peer["result"]["result"]["inputs"]["acme"]["ticker"], "ACME");

    // planning + 2 tool calls + review, all recorded under the step.
    let children = engine.runtime.store.list_children(step.id()).await.unwrap();
    assert_eq!(children.len(), 4);
    assert_eq!(llm.calls(), vec!["emit_plan", "emit_review"]);

    engine.stop().await;
}

#[tokio::test]
async fn unmet_goal_replans_once_more() {
    let llm = Arc::new(ScriptedLlm::new(
        vec![
            json!({"calls": [{"id": "a", "tool": "fetch_price", "params": {"ticker": "ACME"}}]}),
            json!({"calls": [{"id": "a", "tool": "fetch_price", "params": {"ticker": "PEER"}}]}),
        ],
        vec![
            json!({
                "goal_achieved": false,
                "confidence": 0.3,
                "summary": "peer price missing",
                "missing_data": ["peer price"],
                "recovery_actions": ["fetch PEER"]
            }),
            json!({
                "goal_achieved": false,
                "confidence": 0.6,
                "summary": "still unsure",
                "recovery_actions": ["ask again"]
            }),
        ],
    ));
    let engine = engine(
        backend().await,
        Arc::new(FakeFetcher::default()),
        Some(llm.clone()),
        tools(),
    );
    engine.executor.save_definition(&research_definition()).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("research").await.unwrap();
    let manager = wait_terminal(&engine, manager_id).await;
    // Partial success still completes the step; max_rounds stops the loop.
    assert_eq!(manager.status(), JobStatus::Completed);

    let step = engine
        .runtime
        .load(child_id(manager_id, "step:0:answer"))
        .await
        .unwrap();
    let result = step.state.result.clone().unwrap();
    assert_eq!(result["rounds"], 2);
    assert_eq!(result["review"]["goal_achieved"], false);
    assert_eq!(result["results"][0]["result"]["result"]["ticker"], "PEER");
    assert_eq!(step.state.metadata["plan_context"].as_array().map(|c| c.len()), Some(1));
    assert_eq!(
        llm.calls(),
        vec!["emit_plan", "emit_review", "emit_plan", "emit_review"]
    );

    engine.stop().await;
}

#[tokio::test]
async fn orchestrate_needs_a_provider() {
    let engine = engine(
        backend().await,
        Arc::new(FakeFetcher::default()),
        None,
        tools(),
    );
    let err = engine
        .executor
        .save_definition(&research_definition())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("orchestrate"), "{err}");
}

#[tokio::test]
async fn step_timeout_fails_the_step_and_cancels_tools() {
    let llm = Arc::new(ScriptedLlm::new(
        vec![json!({"calls": [{"id": "report", "tool": "slow_report", "params": {}}]})],
        vec![],
    ));
    let engine = engine(
        backend().await,
        Arc::new(FakeFetcher::default()),
        Some(llm.clone()),
        tools(),
    );
    let def = definition(json!({
        "id": "report",
        "name": "Report",
        "steps": [{
            "name": "compile",
            "action": "orchestrate",
            "goal": "Compile the quarterly report",
            "tools": ["slow_report"],
            "timeout_secs": 1
        }]
    }));
    engine.executor.save_definition(&def).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("report").await.unwrap();
    let manager = wait_terminal(&engine, manager_id).await;
    assert_eq!(manager.status(), JobStatus::Failed);

    let step = engine
        .runtime
        .load(child_id(manager_id, "step:0:compile"))
        .await
        .unwrap();
    assert_eq!(step.status(), JobStatus::Failed);
    assert_eq!(step.state.error.as_deref(), Some("step timed out"));
    assert_eq!(step.state.metadata["error_code"], "timeout");

    // The running tool job was cancelled and the reviewer never consulted.
    let tool_job = engine
        .runtime
        .load(jobweave::orchestrator::tool_job_id(step.id(), 0, "report"))
        .await
        .unwrap();
    assert_eq!(tool_job.status(), JobStatus::Cancelled);
    assert_eq!(llm.calls(), vec!["emit_plan"]);

    engine.stop().await;
}
