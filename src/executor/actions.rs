//! Step actions and their registry.
//!
//! Every step names an action; the registry maps its `(type, action)` key
//! to a handler and tells the executor how the step completes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::documents::SearchIndex;
use crate::error::HandlerError;
use crate::events::JobEvent;
use crate::jobs::config::{CompletionMode, CrawlPageConfig, JobConfig};
use crate::jobs::definition::{ActionKey, StepAction, StepDefinition};
use crate::jobs::model::{Job, JobRecord, child_id};
use crate::jobs::retention;
use crate::orchestrator::Phase;
use crate::queue::QueueMessage;
use crate::runtime::Runtime;
use crate::store::traits::LogLevel;

/// What a step action sees.
pub struct StepContext {
    pub runtime: Runtime,
    pub manager: JobRecord,
    pub step: JobRecord,
    pub definition: StepDefinition,
    /// 1-based attempt of this step.
    pub attempt: u32,
}

/// Result of running a step action.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Inline action finished; the step completes now.
    Completed {
        result: Option<serde_json::Value>,
        result_count: i64,
    },
    /// Children or a driver message were started; the step completes later.
    Started,
}

#[async_trait]
pub trait StepActionHandler: Send + Sync {
    fn key(&self) -> ActionKey;

    fn mode(&self) -> CompletionMode;

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError>;
}

/// Step actions keyed by `(type, action)`.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionKey, Arc<dyn StepActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: Arc<dyn StepActionHandler>) {
        self.actions.insert(action.key(), action);
    }

    pub fn get(&self, key: &ActionKey) -> Option<Arc<dyn StepActionHandler>> {
        self.actions.get(key).cloned()
    }

    pub fn mode(&self, key: &ActionKey) -> Option<CompletionMode> {
        self.actions.get(key).map(|a| a.mode())
    }

    pub fn keys(&self) -> Vec<ActionKey> {
        self.actions.keys().copied().collect()
    }
}

fn mismatch(ctx: &StepContext, expected: &str) -> HandlerError {
    HandlerError::Terminal(format!(
        "step '{}' is not a {expected} step",
        ctx.definition.name
    ))
}

// ── Crawl ───────────────────────────────────────────────────────────

/// Fans out one `crawl_page` job per seed; pages add more as they run.
pub struct CrawlAction;

#[async_trait]
impl StepActionHandler for CrawlAction {
    fn key(&self) -> ActionKey {
        ActionKey {
            job_type: "crawler",
            action: "crawl",
        }
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::Probe
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError> {
        let StepAction::Crawl {
            seeds,
            max_depth,
            max_pages,
            include,
            exclude,
            same_host,
        } = &ctx.definition.action
        else {
            return Err(mismatch(ctx, "crawl"));
        };

        let mut spawned = 0;
        for seed in seeds.iter().take(*max_pages as usize) {
            let host = if *same_host {
                reqwest::Url::parse(seed)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
            } else {
                None
            };
            let page = Job::child_of(
                &ctx.step.job,
                child_id(ctx.step.id(), seed),
                seed.clone(),
                JobConfig::CrawlPage(CrawlPageConfig {
                    url: seed.clone(),
                    depth: 0,
                    max_depth: *max_depth,
                    max_pages: *max_pages,
                    include: include.clone(),
                    exclude: exclude.clone(),
                    host,
                }),
            );
            if ctx.runtime.spawn_work(&page).await? {
                spawned += 1;
            }
        }

        ctx.runtime
            .arm_probe(ctx.step.id(), ctx.runtime.config.probe.initial_delay)
            .await?;
        info!(job_id = %ctx.step.id(), seeds = seeds.len(), spawned, "Crawl started");
        Ok(StepOutput::Started)
    }
}

// ── Reindex ─────────────────────────────────────────────────────────

pub struct ReindexAction {
    index: Arc<dyn SearchIndex>,
}

impl ReindexAction {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl StepActionHandler for ReindexAction {
    fn key(&self) -> ActionKey {
        ActionKey {
            job_type: "index",
            action: "reindex",
        }
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::Inline
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError> {
        let stats = self.index.rebuild().await?;
        ctx.runtime
            .log(
                ctx.step.id(),
                LogLevel::Info,
                &format!("Index rebuilt over {} documents", stats.documents),
            )
            .await;
        Ok(StepOutput::Completed {
            result: Some(json!(stats)),
            result_count: stats.documents as i64,
        })
    }
}

// ── Notify ──────────────────────────────────────────────────────────

pub struct NotifyAction;

#[async_trait]
impl StepActionHandler for NotifyAction {
    fn key(&self) -> ActionKey {
        ActionKey {
            job_type: "notify",
            action: "send",
        }
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::Inline
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError> {
        let StepAction::Notify { message, channel } = &ctx.definition.action else {
            return Err(mismatch(ctx, "notify"));
        };

        ctx.runtime.events.publish(JobEvent::Notification {
            job_id: ctx.manager.id(),
            channel: channel.clone(),
            message: message.clone(),
        });
        ctx.runtime
            .log(ctx.manager.id(), LogLevel::Info, &format!("Notification: {message}"))
            .await;
        Ok(StepOutput::Completed {
            result: Some(json!({ "channel": channel, "message": message, "sent_at": Utc::now() })),
            result_count: 1,
        })
    }
}

// ── Orchestrate ─────────────────────────────────────────────────────

/// Hands the step to the orchestrator, which completes it.
pub struct OrchestrateAction;

#[async_trait]
impl StepActionHandler for OrchestrateAction {
    fn key(&self) -> ActionKey {
        ActionKey {
            job_type: "orchestrator",
            action: "orchestrate",
        }
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::SelfManaged
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError> {
        if !matches!(ctx.definition.action, StepAction::Orchestrate { .. }) {
            return Err(mismatch(ctx, "orchestrate"));
        }
        let payload = serde_json::to_value(Phase::start())
            .map_err(|e| HandlerError::Terminal(format!("orchestrator phase: {e}")))?;
        ctx.runtime
            .queue
            .enqueue(&QueueMessage::orchestrate(ctx.step.id(), payload))
            .await?;
        Ok(StepOutput::Started)
    }
}

// ── Cleanup ─────────────────────────────────────────────────────────

/// Deletes expired terminal root jobs.
pub struct CleanupAction;

#[async_trait]
impl StepActionHandler for CleanupAction {
    fn key(&self) -> ActionKey {
        ActionKey {
            job_type: "maintenance",
            action: "cleanup",
        }
    }

    fn mode(&self) -> CompletionMode {
        CompletionMode::Inline
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError> {
        let StepAction::Cleanup {
            max_age_hours,
            dry_run,
        } = &ctx.definition.action
        else {
            return Err(mismatch(ctx, "cleanup"));
        };

        let retention = &ctx.runtime.config.retention;
        let max_age = max_age_hours
            .map(|h| std::time::Duration::from_secs(h * 3600))
            .unwrap_or(retention.max_age);
        let report =
            retention::cleanup(&ctx.runtime, max_age, *dry_run || retention.dry_run).await?;

        let count = if report.dry_run {
            report.candidates.len()
        } else {
            report.deleted as usize
        };
        Ok(StepOutput::Completed {
            result: Some(json!(report)),
            result_count: count as i64,
        })
    }
}

/// Registry with the built-in actions. `orchestrate` needs an LLM provider
/// and is only registered when one is configured.
pub fn builtin_actions(index: Arc<dyn SearchIndex>, orchestrate: bool) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(CrawlAction));
    registry.register(Arc::new(ReindexAction::new(index)));
    registry.register(Arc::new(NotifyAction));
    registry.register(Arc::new(CleanupAction));
    if orchestrate {
        registry.register(Arc::new(OrchestrateAction));
    }
    registry
}
