//! LLM orchestrator: plan tool calls, run them as jobs, review the results.
//!
//! An orchestrate step is driven by one `orchestrate:{step}` message whose
//! payload is the current `Phase`. Each delivery does one phase's worth of
//! work and reschedules itself with the next phase, so a crash anywhere
//! resumes from the last persisted phase. Planner and reviewer calls are
//! recorded as `planning`/`review` child jobs with deterministic ids; a
//! completed record is reused instead of calling the model again.

pub mod plan;
pub mod review;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HandlerError, PlanError};
use crate::jobs::config::{JobConfig, ToolCallConfig};
use crate::jobs::definition::StepAction;
use crate::jobs::model::{Job, JobRecord, JobStatus, child_id};
use crate::llm::{LlmProvider, ToolCompletionRequest};
use crate::queue::{Lease, kinds};
use crate::runtime::Runtime;
use crate::store::traits::LogLevel;
use crate::tools::ToolRegistry;
use crate::worker::{HandlerOutcome, MessageHandler};

use plan::{EMIT_PLAN, PlannedCall};
use review::{CallOutcome, EMIT_REVIEW, Review};

/// Step metadata key holding what earlier rounds learned.
const CONTEXT_KEY: &str = "plan_context";

/// Where an orchestrate step is. Carried as the message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    /// Ask the planner for this round's tool calls.
    Plan { round: u32 },
    /// Tool jobs are running.
    Wait {
        round: u32,
        plan_id: Uuid,
        /// Calls not yet terminal at the last check.
        #[serde(default)]
        waiting_on: Vec<String>,
        /// Unix millis after which unfinished calls are cancelled.
        deadline: i64,
    },
    /// Ask the reviewer whether the goal was met.
    Review { round: u32 },
}

impl Phase {
    pub fn start() -> Self {
        Self::Plan { round: 0 }
    }

    pub fn plan(round: u32) -> Self {
        Self::Plan { round }
    }
}

/// Id of the tool job for `call_id` in `round`.
pub fn tool_job_id(step_id: Uuid, round: u32, call_id: &str) -> Uuid {
    child_id(step_id, &format!("tool:{round}:{call_id}"))
}

fn planning_job_id(step_id: Uuid, round: u32) -> Uuid {
    child_id(step_id, &format!("planning:{round}"))
}

fn review_job_id(step_id: Uuid, round: u32) -> Uuid {
    child_id(step_id, &format!("review:{round}"))
}

/// Bad model output fails the step with the plan error as its message.
fn plan_failure(e: PlanError) -> HandlerError {
    HandlerError::Terminal(e.to_string())
}

fn phase_payload(phase: &Phase) -> Result<serde_json::Value, HandlerError> {
    serde_json::to_value(phase)
        .map_err(|e| HandlerError::Terminal(format!("orchestrator phase: {e}")))
}

/// The orchestrate step being driven.
struct Drive<'a> {
    step: &'a JobRecord,
    goal: &'a str,
    tools: &'a [String],
    max_rounds: u32,
    /// Unix millis at which the step times out.
    deadline: Option<i64>,
}

impl Drive<'_> {
    fn expired(&self, now: i64) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// When a step with `timeout` times out, counted from its start.
fn step_deadline(step: &JobRecord, timeout: Option<Duration>) -> Option<i64> {
    let started = step.state.started_at?.timestamp_millis();
    Some(started.saturating_add(timeout?.as_millis().min(i64::MAX as u128) as i64))
}

/// Handles `orchestrate` messages.
pub struct OrchestratorHandler {
    runtime: Runtime,
    llm: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
}

impl OrchestratorHandler {
    pub fn new(runtime: Runtime, llm: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            runtime,
            llm,
            tools,
        }
    }

    // ── Plan ────────────────────────────────────────────────────────

    async fn plan(&self, drive: &Drive<'_>, round: u32) -> Result<HandlerOutcome, HandlerError> {
        let step = drive.step;
        let store = &self.runtime.store;
        store
            .merge_metadata(step.id(), &json!({ "round": round }))
            .await?;

        let planning = Job::child_of(
            &step.job,
            planning_job_id(step.id(), round),
            format!("planning round {}", round + 1),
            JobConfig::Planning { round },
        );
        store.create_job(&planning).await?;
        let record = self.runtime.load(planning.id).await?;

        let calls = match record.status() {
            JobStatus::Completed => Self::stored_plan(&record)?,
            JobStatus::Failed | JobStatus::Cancelled => {
                let reason = record
                    .state
                    .error
                    .unwrap_or_else(|| "planning failed".to_string());
                self.runtime
                    .fail(step.id(), &reason, Some("planning_failed"))
                    .await?;
                return Ok(HandlerOutcome::Done);
            }
            JobStatus::Pending | JobStatus::Running => {
                if record.status() == JobStatus::Pending {
                    self.runtime.start(&planning).await?;
                }
                match self.request_plan(drive, round).await {
                    Ok(calls) => {
                        store
                            .set_result(planning.id, &json!({ "calls": calls }), calls.len() as i64)
                            .await?;
                        self.runtime
                            .finish(&planning, JobStatus::Completed, None)
                            .await?;
                        calls
                    }
                    Err(HandlerError::Terminal(reason)) => {
                        self.runtime
                            .finish(&planning, JobStatus::Failed, Some(&reason))
                            .await?;
                        self.runtime
                            .fail(step.id(), &reason, Some("planning_failed"))
                            .await?;
                        warn!(job_id = %step.id(), round, "Planning failed: {}", reason);
                        return Ok(HandlerOutcome::Done);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.runtime
            .log(
                step.id(),
                LogLevel::Info,
                &format!("Round {}: planned {} tool call(s)", round + 1, calls.len()),
            )
            .await;
        info!(job_id = %step.id(), round, calls = calls.len(), "Plan ready");

        let max_wait = Utc::now().timestamp_millis()
            + self.runtime.config.orchestrator.max_wait.as_millis() as i64;
        let deadline = drive.deadline.map_or(max_wait, |d| d.min(max_wait));
        let waiting_on = self.dispatch(step, round, planning.id, &calls).await?;
        let next = Phase::Wait {
            round,
            plan_id: planning.id,
            waiting_on,
            deadline,
        };
        Ok(HandlerOutcome::after_with(Duration::ZERO, phase_payload(&next)?))
    }

    async fn request_plan(
        &self,
        drive: &Drive<'_>,
        round: u32,
    ) -> Result<Vec<PlannedCall>, HandlerError> {
        let definitions = self.tools.tool_definitions_for(drive.tools).await;
        let available: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        let context: Vec<String> = drive
            .step
            .state
            .metadata
            .get(CONTEXT_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let request = ToolCompletionRequest::new(
            plan::planning_messages(drive.goal, &definitions, &context, round),
            vec![plan::plan_tool()],
        )
        .forcing(EMIT_PLAN)
        .with_max_tokens(self.runtime.config.orchestrator.max_tokens)
        .with_temperature(0.0);
        let response = self.llm.complete_with_tools(request).await?;

        let args = response.arguments_for(EMIT_PLAN).ok_or_else(|| {
            plan_failure(PlanError::Malformed {
                phase: "planning".to_string(),
                reason: format!("model did not call {EMIT_PLAN}"),
            })
        })?;
        plan::parse_plan(args, &available).map_err(plan_failure)
    }

    fn stored_plan(record: &JobRecord) -> Result<Vec<PlannedCall>, HandlerError> {
        record
            .state
            .result
            .as_ref()
            .and_then(|r| r.get("calls"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| HandlerError::Terminal(format!("stored plan is unreadable: {e}")))?
            .ok_or_else(|| HandlerError::Terminal("stored plan is missing".to_string()))
    }

    // ── Execute ─────────────────────────────────────────────────────

    /// Spawn every call whose dependencies are all terminal. Returns the
    /// calls that are not terminal yet.
    async fn dispatch(
        &self,
        step: &JobRecord,
        round: u32,
        plan_id: Uuid,
        calls: &[PlannedCall],
    ) -> Result<Vec<String>, HandlerError> {
        let mut statuses = self.call_statuses(step.id(), round).await?;
        let mut waiting = Vec::new();

        for call in calls {
            let terminal = |id: &str| statuses.get(id).is_some_and(|s| s.is_terminal());
            if terminal(&call.id) {
                continue;
            }
            waiting.push(call.id.clone());
            if statuses.contains_key(&call.id) {
                continue;
            }
            if !call.depends_on.iter().all(|d| terminal(d)) {
                continue;
            }

            let job = Job::child_of(
                &step.job,
                tool_job_id(step.id(), round, &call.id),
                format!("{} ({})", call.tool, call.id),
                JobConfig::ToolCall(ToolCallConfig {
                    call_id: call.id.clone(),
                    tool: call.tool.clone(),
                    params: call.params.clone(),
                    depends_on: call.depends_on.clone(),
                    round,
                    plan_id,
                }),
            );
            self.runtime.spawn_work(&job).await?;
            statuses.insert(call.id.clone(), JobStatus::Pending);
        }
        Ok(waiting)
    }

    /// Status of each tool job of `round`, by call id.
    async fn call_statuses(
        &self,
        step_id: Uuid,
        round: u32,
    ) -> Result<HashMap<String, JobStatus>, HandlerError> {
        Ok(self
            .tool_jobs(step_id, round)
            .await?
            .into_iter()
            .map(|(call_id, record)| (call_id, record.status()))
            .collect())
    }

    async fn tool_jobs(
        &self,
        step_id: Uuid,
        round: u32,
    ) -> Result<HashMap<String, JobRecord>, HandlerError> {
        let children = self.runtime.store.list_children(step_id).await?;
        Ok(children
            .into_iter()
            .filter_map(|record| match &record.job.config {
                JobConfig::ToolCall(cfg) if cfg.round == round => {
                    Some((cfg.call_id.clone(), record))
                }
                _ => None,
            })
            .collect())
    }

    async fn wait(
        &self,
        drive: &Drive<'_>,
        round: u32,
        plan_id: Uuid,
        deadline: i64,
    ) -> Result<HandlerOutcome, HandlerError> {
        let step = drive.step;
        let planning = self.runtime.load(plan_id).await?;
        let calls = Self::stored_plan(&planning)?;
        let waiting_on = self.dispatch(step, round, plan_id, &calls).await?;

        if waiting_on.is_empty() {
            return Ok(HandlerOutcome::after_with(
                Duration::ZERO,
                phase_payload(&Phase::Review { round })?,
            ));
        }

        let now = Utc::now().timestamp_millis();
        if drive.expired(now) {
            return self.time_out(step).await;
        }
        if now >= deadline {
            let jobs = self.tool_jobs(step.id(), round).await?;
            for call_id in &waiting_on {
                if let Some(record) = jobs.get(call_id) {
                    self.runtime
                        .cancel_tree(record.id(), "timed out waiting for tool results")
                        .await?;
                }
            }
            self.runtime
                .store
                .merge_metadata(step.id(), &json!({ "timed_out_calls": waiting_on }))
                .await?;
            self.runtime
                .log(
                    step.id(),
                    LogLevel::Warn,
                    &format!(
                        "Round {}: gave up waiting on {} call(s)",
                        round + 1,
                        waiting_on.len()
                    ),
                )
                .await;
            return Ok(HandlerOutcome::after_with(
                Duration::ZERO,
                phase_payload(&Phase::Review { round })?,
            ));
        }

        let next = Phase::Wait {
            round,
            plan_id,
            waiting_on,
            deadline,
        };
        Ok(HandlerOutcome::after_with(
            self.runtime.config.orchestrator.poll_interval,
            phase_payload(&next)?,
        ))
    }

    /// Fail the step and cancel whatever it still has running.
    async fn time_out(&self, step: &JobRecord) -> Result<HandlerOutcome, HandlerError> {
        warn!(job_id = %step.id(), "Orchestrate step timed out");
        self.runtime
            .fail(step.id(), "step timed out", Some("timeout"))
            .await?;
        let cancelled = self
            .runtime
            .cancel_descendants(step.id(), "parent step timed out")
            .await?;
        debug!(job_id = %step.id(), cancelled, "Cancelled children of timed-out step");
        Ok(HandlerOutcome::Done)
    }

    // ── Review ──────────────────────────────────────────────────────

    async fn outcomes(&self, step_id: Uuid, round: u32) -> Result<Vec<CallOutcome>, HandlerError> {
        let planning = self.runtime.load(planning_job_id(step_id, round)).await?;
        let calls = Self::stored_plan(&planning)?;
        let jobs = self.tool_jobs(step_id, round).await?;

        Ok(calls
            .iter()
            .map(|call| match jobs.get(&call.id) {
                Some(record) => CallOutcome {
                    call_id: call.id.clone(),
                    tool: call.tool.clone(),
                    status: record.status().to_string(),
                    result: record.state.result.clone(),
                    error: record.state.error.clone(),
                },
                None => CallOutcome {
                    call_id: call.id.clone(),
                    tool: call.tool.clone(),
                    status: "not_run".to_string(),
                    result: None,
                    error: None,
                },
            })
            .collect())
    }

    async fn review(&self, drive: &Drive<'_>, round: u32) -> Result<HandlerOutcome, HandlerError> {
        let step = drive.step;
        let store = &self.runtime.store;
        let outcomes = self.outcomes(step.id(), round).await?;

        let review_job = Job::child_of(
            &step.job,
            review_job_id(step.id(), round),
            format!("review round {}", round + 1),
            JobConfig::Review { round },
        );
        store.create_job(&review_job).await?;
        let record = self.runtime.load(review_job.id).await?;

        let verdict = match record.status() {
            JobStatus::Completed => record
                .state
                .result
                .as_ref()
                .ok_or_else(|| HandlerError::Terminal("stored review is missing".to_string()))
                .and_then(|r| review::parse_review(r).map_err(plan_failure))?,
            JobStatus::Failed | JobStatus::Cancelled => {
                let reason = record
                    .state
                    .error
                    .unwrap_or_else(|| "review failed".to_string());
                self.runtime
                    .fail(step.id(), &reason, Some("review_failed"))
                    .await?;
                return Ok(HandlerOutcome::Done);
            }
            JobStatus::Pending | JobStatus::Running => {
                if record.status() == JobStatus::Pending {
                    self.runtime.start(&review_job).await?;
                }
                match self.request_review(drive.goal, &outcomes).await {
                    Ok(verdict) => {
                        let value = serde_json::to_value(&verdict)
                            .map_err(|e| HandlerError::Terminal(format!("review: {e}")))?;
                        store.set_result(review_job.id, &value, 1).await?;
                        self.runtime
                            .finish(&review_job, JobStatus::Completed, None)
                            .await?;
                        verdict
                    }
                    Err(HandlerError::Terminal(reason)) => {
                        self.runtime
                            .finish(&review_job, JobStatus::Failed, Some(&reason))
                            .await?;
                        self.runtime
                            .fail(step.id(), &reason, Some("review_failed"))
                            .await?;
                        return Ok(HandlerOutcome::Done);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        info!(
            job_id = %step.id(),
            round,
            goal_achieved = verdict.goal_achieved,
            confidence = verdict.confidence,
            "Review done"
        );

        if verdict.wants_replan(round, drive.max_rounds) {
            let mut context: Vec<String> = step
                .state
                .metadata
                .get(CONTEXT_KEY)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            context.push(verdict.digest(round));
            store
                .merge_metadata(step.id(), &json!({ CONTEXT_KEY: context }))
                .await?;
            self.runtime
                .log(
                    step.id(),
                    LogLevel::Info,
                    &format!("Round {}: goal not met, planning again", round + 1),
                )
                .await;
            return Ok(HandlerOutcome::after_with(
                Duration::ZERO,
                phase_payload(&Phase::plan(round + 1))?,
            ));
        }

        let succeeded = outcomes
            .iter()
            .filter(|o| o.status == JobStatus::Completed.as_str())
            .count();
        let result = json!({
            "review": verdict,
            "rounds": round + 1,
            "results": outcomes,
        });
        store.set_result(step.id(), &result, succeeded as i64).await?;
        store
            .merge_metadata(
                step.id(),
                &json!({ "goal_achieved": verdict.goal_achieved, "confidence": verdict.confidence }),
            )
            .await?;
        self.runtime
            .log(
                step.id(),
                LogLevel::Info,
                &format!(
                    "Orchestration finished after {} round(s): {}",
                    round + 1,
                    verdict.summary
                ),
            )
            .await;
        self.runtime
            .finish(&step.job, JobStatus::Completed, None)
            .await?;
        Ok(HandlerOutcome::Done)
    }

    async fn request_review(
        &self,
        goal: &str,
        outcomes: &[CallOutcome],
    ) -> Result<Review, HandlerError> {
        let request = ToolCompletionRequest::new(
            review::review_messages(goal, outcomes),
            vec![review::review_tool()],
        )
        .forcing(EMIT_REVIEW)
        .with_max_tokens(self.runtime.config.orchestrator.max_tokens)
        .with_temperature(0.0);
        let response = self.llm.complete_with_tools(request).await?;

        let args = response.arguments_for(EMIT_REVIEW).ok_or_else(|| {
            plan_failure(PlanError::Malformed {
                phase: "review".to_string(),
                reason: format!("model did not call {EMIT_REVIEW}"),
            })
        })?;
        review::parse_review(args).map_err(plan_failure)
    }
}

#[async_trait]
impl MessageHandler for OrchestratorHandler {
    fn kind(&self) -> &str {
        kinds::ORCHESTRATE
    }

    async fn handle(&self, lease: &Lease) -> Result<HandlerOutcome, HandlerError> {
        let step_id = lease.message.job_id;
        let Some(step) = self.runtime.store.get_job(step_id).await? else {
            return Ok(HandlerOutcome::Done);
        };
        if step.status() != JobStatus::Running {
            return Ok(HandlerOutcome::Done);
        }

        let Some((_, definition, _)) = step.job.config.as_step() else {
            return Err(HandlerError::Terminal(format!(
                "job {step_id} is not a step"
            )));
        };
        let StepAction::Orchestrate {
            goal,
            tools,
            max_rounds,
        } = &definition.action
        else {
            return Err(HandlerError::Terminal(format!(
                "step '{}' is not an orchestrate step",
                definition.name
            )));
        };

        let phase: Phase = serde_json::from_value(lease.message.payload.clone())
            .map_err(|e| HandlerError::Terminal(format!("bad orchestrator phase: {e}")))?;
        let drive = Drive {
            step: &step,
            goal,
            tools,
            max_rounds: max_rounds
                .unwrap_or(self.runtime.config.orchestrator.max_rounds)
                .max(1),
            deadline: step_deadline(&step, definition.timeout()),
        };
        if drive.expired(Utc::now().timestamp_millis()) {
            return self.time_out(&step).await;
        }

        match phase {
            Phase::Plan { round } => self.plan(&drive, round).await,
            Phase::Wait {
                round,
                plan_id,
                deadline,
                ..
            } => self.wait(&drive, round, plan_id, deadline).await,
            Phase::Review { round } => self.review(&drive, round).await,
        }
    }
}
