//! The `advance` handler: walks a manager's steps in order.
//!
//! Each delivery moves the run forward by at most one step transition and
//! relies on the step's completion re-arming `advance:{manager}` for the
//! next one. All decisions are read back from job state, so a redelivered
//! or duplicate advance is harmless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::executor::Executor;
use crate::executor::actions::{StepContext, StepOutput};
use crate::jobs::config::CompletionMode;
use crate::jobs::definition::{JobDefinition, OnError, StepDefinition};
use crate::jobs::model::{JobRecord, JobStatus, child_id};
use crate::queue::{Lease, kinds};
use crate::runtime::Runtime;
use crate::store::traits::LogLevel;
use crate::worker::handler::{HandlerOutcome, MessageHandler};

pub struct AdvanceHandler {
    executor: Arc<Executor>,
}

impl AdvanceHandler {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    fn runtime(&self) -> &Runtime {
        self.executor.runtime()
    }

    /// Time left before the definition timeout, if it has one.
    fn remaining(manager: &JobRecord, def: &JobDefinition) -> Option<chrono::Duration> {
        let timeout = chrono::Duration::from_std(def.timeout()?).ok()?;
        let started = manager.state.started_at.unwrap_or_else(Utc::now);
        Some(started + timeout - Utc::now())
    }

    /// Wait for a running fan-out or self-managed step. With a definition
    /// timeout, come back at the deadline.
    fn wait(remaining: Option<chrono::Duration>) -> HandlerOutcome {
        match remaining.and_then(|r| r.to_std().ok()) {
            Some(left) => HandlerOutcome::after(left + Duration::from_millis(10)),
            None => HandlerOutcome::Done,
        }
    }

    async fn fail_run(&self, manager: &JobRecord, reason: &str) -> Result<(), HandlerError> {
        warn!(job_id = %manager.id(), "Run failed: {}", reason);
        self.runtime().fail(manager.id(), reason, None).await?;
        Ok(())
    }

    /// Apply `on_error` to a failed step. Returns whether the run continues.
    async fn on_failure(
        &self,
        manager: &JobRecord,
        step: &JobRecord,
        def: &StepDefinition,
    ) -> Result<bool, HandlerError> {
        let error = step.state.error.as_deref().unwrap_or("unknown error");
        match def.on_error {
            OnError::Continue => {
                if !step.state.meta_bool("skipped") {
                    self.runtime()
                        .store
                        .merge_metadata(step.id(), &json!({ "skipped": true }))
                        .await?;
                    self.runtime()
                        .log(
                            manager.id(),
                            LogLevel::Warn,
                            &format!("Step '{}' failed, continuing: {error}", def.name),
                        )
                        .await;
                }
                Ok(true)
            }
            // Retry reaching here means attempts ran out, or a fan-out step
            // that cannot be re-run in place.
            OnError::Fail | OnError::Retry { .. } => {
                self.fail_run(manager, &format!("step '{}' failed: {error}", def.name))
                    .await?;
                Ok(false)
            }
        }
    }

    async fn run_step(
        &self,
        manager: &JobRecord,
        step: &JobRecord,
        def: &StepDefinition,
        mode: CompletionMode,
    ) -> Result<HandlerOutcome, HandlerError> {
        let runtime = self.runtime();
        let now = Utc::now().timestamp_millis();

        if let Some(at) = step.state.meta_i64("next_attempt_at")
            && at > now
        {
            return Ok(HandlerOutcome::after(Duration::from_millis((at - now) as u64)));
        }

        let key = def.action.key();
        let Some(action) = self.executor.actions().get(&key) else {
            let reason = format!("no action registered for {key}");
            runtime
                .finish(&step.job, JobStatus::Failed, Some(&reason))
                .await?;
            return Ok(HandlerOutcome::Done);
        };

        let attempt = step.state.meta_i64("attempts").unwrap_or(0).max(0) as u32 + 1;
        runtime
            .store
            .merge_metadata(
                step.id(),
                &json!({ "attempts": attempt, "next_attempt_at": null }),
            )
            .await?;

        let ctx = StepContext {
            runtime: runtime.clone(),
            manager: manager.clone(),
            step: step.clone(),
            definition: def.clone(),
            attempt,
        };
        let timeout = def.timeout().unwrap_or(runtime.config.worker.job_timeout);
        let outcome = match tokio::time::timeout(timeout, action.run(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Terminal(format!(
                "step timed out after {}s",
                timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(StepOutput::Completed {
                result,
                result_count,
            }) => {
                if let Some(result) = &result {
                    runtime
                        .store
                        .set_result(step.id(), result, result_count)
                        .await?;
                }
                info!(job_id = %step.id(), step = %def.name, attempt, "Step completed");
                runtime
                    .finish(&step.job, JobStatus::Completed, None)
                    .await?;
                Ok(HandlerOutcome::Done)
            }
            Ok(StepOutput::Started) => {
                runtime
                    .store
                    .merge_metadata(step.id(), &json!({ "launched": true }))
                    .await?;
                runtime
                    .log(step.id(), LogLevel::Info, &format!("Step '{}' started", def.name))
                    .await;
                Ok(HandlerOutcome::Done)
            }
            Err(e) if mode != CompletionMode::Inline && e.is_retryable() => Err(e),
            Err(e) => {
                let reason = e.to_string();
                if mode == CompletionMode::Inline
                    && let Some(delay) = def.on_error.retry_delay(attempt)
                {
                    let at = now + delay.as_millis() as i64;
                    runtime
                        .store
                        .merge_metadata(
                            step.id(),
                            &json!({ "next_attempt_at": at, "last_error": reason }),
                        )
                        .await?;
                    runtime
                        .log(
                            step.id(),
                            LogLevel::Warn,
                            &format!(
                                "Attempt {attempt} failed, retrying in {}ms: {reason}",
                                delay.as_millis()
                            ),
                        )
                        .await;
                    return Ok(HandlerOutcome::after(delay));
                }

                runtime.log(step.id(), LogLevel::Error, &reason).await;
                runtime
                    .finish(&step.job, JobStatus::Failed, Some(&reason))
                    .await?;
                Ok(HandlerOutcome::Done)
            }
        }
    }

    /// All steps are terminal: chain post-jobs, then complete the manager.
    async fn finish_run(
        &self,
        manager: &JobRecord,
        def: &JobDefinition,
        steps: &[JobRecord],
    ) -> Result<(), HandlerError> {
        let runtime = self.runtime();
        let mut started = Vec::new();
        let mut skipped = Vec::new();

        for post_id in &def.post_jobs {
            let post = match runtime.store.get_definition(post_id).await? {
                None => Err("not found".to_string()),
                Some(post) if !post.enabled => Err("disabled".to_string()),
                Some(post) => self
                    .executor
                    .validate(&post)
                    .map(|_| post)
                    .map_err(|e| e.to_string()),
            };
            match post {
                Ok(post) => {
                    let id = self
                        .executor
                        .launch(
                            &post,
                            child_id(manager.id(), &format!("post:{post_id}")),
                            json!({ "triggered_by": manager.id() }),
                        )
                        .await?;
                    started.push(json!({ "definition": post_id, "job_id": id }));
                }
                Err(reason) => {
                    warn!(job_id = %manager.id(), post_job = %post_id, "Skipping post-job: {}", reason);
                    runtime
                        .log(
                            manager.id(),
                            LogLevel::Warn,
                            &format!("Post-job '{post_id}' skipped: {reason}"),
                        )
                        .await;
                    skipped.push(post_id.clone());
                }
            }
        }

        let summary: Vec<_> = steps
            .iter()
            .map(|s| json!({ "name": s.job.name, "status": s.status(), "result_count": s.state.result_count }))
            .collect();
        runtime
            .store
            .set_result(
                manager.id(),
                &json!({ "steps": summary, "post_jobs": started, "skipped_post_jobs": skipped }),
                started.len() as i64,
            )
            .await?;

        if runtime
            .finish(&manager.job, JobStatus::Completed, None)
            .await?
        {
            info!(job_id = %manager.id(), definition = %def.id, "Run completed");
            runtime
                .log(manager.id(), LogLevel::Info, "Run completed")
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for AdvanceHandler {
    fn kind(&self) -> &str {
        kinds::ADVANCE
    }

    async fn handle(&self, lease: &Lease) -> Result<HandlerOutcome, HandlerError> {
        let runtime = self.runtime();
        let manager_id = lease.message.job_id;
        let Some(manager) = runtime.store.get_job(manager_id).await? else {
            return Ok(HandlerOutcome::Done);
        };
        if manager.status().is_terminal() {
            return Ok(HandlerOutcome::Done);
        }
        let Some(def) = manager.job.config.as_definition().cloned() else {
            return Err(HandlerError::Terminal(format!(
                "job {manager_id} is not a manager"
            )));
        };
        if manager.status() == JobStatus::Pending {
            runtime.start(&manager.job).await?;
        }

        let remaining = Self::remaining(&manager, &def);
        if remaining.is_some_and(|r| r <= chrono::Duration::zero()) {
            let secs = def.timeout_secs.unwrap_or_default();
            self.fail_run(&manager, &format!("definition timed out after {secs}s"))
                .await?;
            return Ok(HandlerOutcome::Done);
        }

        let mut steps = runtime.store.list_children(manager_id).await?;
        steps.sort_by_key(|s| s.job.config.as_step().map_or(usize::MAX, |(i, _, _)| i));

        for step in &steps {
            let Some((_, step_def, mode)) = step.job.config.as_step() else {
                continue;
            };
            match step.status() {
                JobStatus::Completed | JobStatus::Cancelled => continue,
                JobStatus::Failed => {
                    if self.on_failure(&manager, step, step_def).await? {
                        continue;
                    }
                    return Ok(HandlerOutcome::Done);
                }
                JobStatus::Pending => {
                    if !runtime.start(&step.job).await? {
                        return Ok(HandlerOutcome::Done);
                    }
                    let step = runtime.load(step.id()).await?;
                    return self.run_step(&manager, &step, step_def, mode).await;
                }
                JobStatus::Running => {
                    if mode == CompletionMode::Inline || !step.state.meta_bool("launched") {
                        return self.run_step(&manager, step, step_def, mode).await;
                    }
                    return Ok(Self::wait(remaining));
                }
            }
        }

        self.finish_run(&manager, &def, &steps).await?;
        Ok(HandlerOutcome::Done)
    }
}
