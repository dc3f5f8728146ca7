//! Engine assembly: wires the store, queue, registries and worker pool.
//!
//! Both the binary and the integration tests build the engine here, so the
//! set of registered handlers and actions is the same everywhere.

use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::executor::{
    AdvanceHandler, Executor, RecoveryReport, StepActionHandler, builtin_actions,
};
use crate::handlers::{CrawlPageHandler, PageFetcher, ToolCallHandler};
use crate::jobs::JobService;
use crate::llm::LlmProvider;
use crate::orchestrator::OrchestratorHandler;
use crate::probe::ProbeHandler;
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;
use crate::store::LibSqlBackend;
use crate::tools::ToolRegistry;
use crate::worker::{HandlerRegistry, WorkJobHandler, WorkerPool};

/// Pluggable collaborators.
pub struct EngineDeps {
    pub fetcher: Arc<dyn PageFetcher>,
    /// Without a provider, orchestrate steps are not available.
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub tools: Arc<ToolRegistry>,
    /// Step actions registered over the built-ins with the same key.
    pub actions: Vec<Arc<dyn StepActionHandler>>,
}

pub struct Engine {
    pub runtime: Runtime,
    pub executor: Arc<Executor>,
    pub service: Arc<JobService>,
    pub scheduler: Arc<Scheduler>,
    pool: WorkerPool,
    work_kinds: Vec<String>,
}

impl Engine {
    pub fn new(config: EngineConfig, backend: Arc<LibSqlBackend>, deps: EngineDeps) -> Self {
        let queue = Arc::new(backend.queue(config.queue.clone()));
        let runtime = Runtime::new(backend.clone(), queue, EventBus::new(), config);

        let mut actions = builtin_actions(backend.clone(), deps.llm.is_some());
        for action in deps.actions {
            actions.register(action);
        }
        let executor = Arc::new(Executor::new(runtime.clone(), actions));

        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(AdvanceHandler::new(executor.clone())));
        handlers.register(Arc::new(ProbeHandler::new(runtime.clone())));
        handlers.register(Arc::new(WorkJobHandler::new(
            runtime.clone(),
            Arc::new(CrawlPageHandler::new(deps.fetcher, backend.clone())),
        )));
        handlers.register(Arc::new(WorkJobHandler::new(
            runtime.clone(),
            Arc::new(ToolCallHandler::new(deps.tools.clone())),
        )));
        if let Some(llm) = deps.llm {
            handlers.register(Arc::new(OrchestratorHandler::new(
                runtime.clone(),
                llm,
                deps.tools,
            )));
        }
        let work_kinds = handlers.kinds();

        Self {
            service: Arc::new(JobService::new(executor.clone())),
            scheduler: Arc::new(Scheduler::new(executor.clone())),
            pool: WorkerPool::new(runtime.clone(), handlers),
            runtime,
            executor,
            work_kinds,
        }
    }

    /// Re-queue work lost in a previous crash, then start the workers.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = self.executor.recover(&self.work_kinds).await?;
        self.pool.start().await;
        info!(?report, "Engine started");
        Ok(report)
    }

    pub async fn stop(&self) {
        self.pool.stop().await;
    }
}
