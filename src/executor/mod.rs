//! Step/job executor.
//!
//! `execute` turns a definition into a manager job with one pending step
//! job per step, then hands the manager to the `advance` handler, which
//! walks the steps in order and chains post-jobs once they are done.

pub mod actions;
pub mod advance;

pub use actions::{ActionRegistry, StepActionHandler, StepContext, StepOutput, builtin_actions};
pub use advance::AdvanceHandler;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, DefinitionError, Result};
use crate::jobs::config::{CompletionMode, JobConfig};
use crate::jobs::definition::JobDefinition;
use crate::jobs::model::{Job, JobStatus, child_id};
use crate::orchestrator::Phase;
use crate::queue::QueueMessage;
use crate::runtime::Runtime;
use crate::store::traits::{JobFilter, LogLevel};

/// What startup recovery re-queued.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub managers: usize,
    pub probes: usize,
    pub orchestrators: usize,
    pub work: usize,
}

/// Starts definition runs.
pub struct Executor {
    runtime: Runtime,
    actions: Arc<ActionRegistry>,
}

impl Executor {
    pub fn new(runtime: Runtime, actions: ActionRegistry) -> Self {
        Self {
            runtime,
            actions: Arc::new(actions),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Structural validation plus every step resolving to a registered action.
    pub fn validate(&self, def: &JobDefinition) -> std::result::Result<(), DefinitionError> {
        def.validate()?;
        for step in &def.steps {
            let key = step.action.key();
            if self.actions.get(&key).is_none() {
                return Err(DefinitionError::UnknownAction {
                    job_type: key.job_type.to_string(),
                    action: key.action.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validate and store a definition.
    pub async fn save_definition(&self, def: &JobDefinition) -> Result<()> {
        self.validate(def)?;
        self.runtime.store.save_definition(def).await?;
        info!(definition = %def.id, steps = def.steps.len(), "Definition saved");
        Ok(())
    }

    /// Run a stored definition. Returns the new manager id.
    pub async fn execute(&self, definition_id: &str) -> Result<Uuid> {
        let def = self
            .runtime
            .store
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| DefinitionError::NotFound {
                id: definition_id.to_string(),
            })?;
        if !def.enabled {
            return Err(DefinitionError::Disabled { id: def.id }.into());
        }
        self.validate(&def)?;
        self.launch(&def, Uuid::new_v4(), serde_json::json!({})).await
    }

    /// Create the manager and its steps and queue the first advance.
    ///
    /// Launching an id that already exists only makes sure an active
    /// manager has its advance message, so chained post-jobs start once.
    pub async fn launch(
        &self,
        def: &JobDefinition,
        manager_id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<Uuid> {
        let manager = Job::root_with_id(
            manager_id,
            def.name.clone(),
            JobConfig::Manager {
                definition: def.clone(),
            },
        );

        if !self.runtime.store.create_job(&manager).await? {
            if let Some(existing) = self.runtime.store.get_job(manager_id).await?
                && existing.status().is_active()
            {
                self.runtime
                    .queue
                    .enqueue(&QueueMessage::advance(manager_id))
                    .await?;
            }
            return Ok(manager_id);
        }

        if metadata.as_object().is_some_and(|m| !m.is_empty()) {
            self.runtime
                .store
                .merge_metadata(manager_id, &metadata)
                .await?;
        }

        for (index, step) in def.steps.iter().enumerate() {
            let key = step.action.key();
            let completion =
                self.actions
                    .mode(&key)
                    .ok_or_else(|| DefinitionError::UnknownAction {
                        job_type: key.job_type.to_string(),
                        action: key.action.to_string(),
                    })?;
            let step_job = Job::child_of(
                &manager,
                child_id(manager_id, &format!("step:{index}:{}", step.name)),
                step.name.clone(),
                JobConfig::Step {
                    index,
                    step: step.clone(),
                    completion,
                },
            );
            self.runtime.store.create_job(&step_job).await?;
        }

        self.runtime.start(&manager).await?;
        self.runtime
            .queue
            .enqueue(&QueueMessage::advance(manager_id))
            .await?;
        self.runtime
            .log(
                manager_id,
                LogLevel::Info,
                &format!("Started definition '{}' ({} steps)", def.id, def.steps.len()),
            )
            .await;
        info!(job_id = %manager_id, definition = %def.id, "Definition launched");
        Ok(manager_id)
    }

    /// Re-queue messages lost in a crash: advances for active managers,
    /// probes and orchestrator drivers for running steps, and work messages
    /// for active work jobs with a registered handler.
    pub async fn recover(&self, work_kinds: &[String]) -> Result<RecoveryReport> {
        let filter =
            JobFilter::default().with_statuses(vec![JobStatus::Pending, JobStatus::Running]);
        let active = self.runtime.store.list_jobs(&filter).await?.jobs;
        let queue = &self.runtime.queue;
        let mut report = RecoveryReport::default();

        for record in active {
            let job = &record.job;
            match job.depth {
                0 => {
                    if queue.enqueue(&QueueMessage::advance(job.id)).await? {
                        report.managers += 1;
                    }
                }
                // Unlaunched steps are picked up again by their manager's advance.
                1 if record.status() == JobStatus::Running && record.state.meta_bool("launched") => {
                    match job.config.as_step() {
                        Some((_, _, CompletionMode::Probe)) => {
                            if !queue.contains(&format!("probe:{}", job.id)).await? {
                                self.runtime
                                    .arm_probe(job.id, self.runtime.config.probe.initial_delay)
                                    .await?;
                                report.probes += 1;
                            }
                        }
                        Some((_, _, CompletionMode::SelfManaged)) => {
                            let round = record.state.meta_i64("round").unwrap_or(0).max(0) as u32;
                            let payload = serde_json::to_value(Phase::plan(round))
                                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                            if queue
                                .enqueue(&QueueMessage::orchestrate(job.id, payload))
                                .await?
                            {
                                report.orchestrators += 1;
                            }
                        }
                        _ => {}
                    }
                }
                1 => {}
                _ => {
                    if !work_kinds.iter().any(|k| k == job.job_type()) {
                        continue;
                    }
                    if queue.enqueue(&QueueMessage::work(job)).await? {
                        report.work += 1;
                    }
                }
            }
        }

        if report.managers + report.probes + report.orchestrators + report.work > 0 {
            warn!(?report, "Recovered orphaned jobs");
        }
        Ok(report)
    }
}
