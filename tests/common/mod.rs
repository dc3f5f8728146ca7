//! Shared harness for the integration tests: fast timings, an in-memory
//! database, a scripted page fetcher and helpers to wait on jobs.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use jobweave::config::{EngineConfig, OrchestratorConfig, ProbeConfig, QueueConfig, WorkerConfig};
use jobweave::engine::{Engine, EngineDeps};
use jobweave::executor::StepActionHandler;
use jobweave::handlers::{FetchError, FetchedPage, PageFetcher};
use jobweave::jobs::{JobDefinition, JobRecord};
use jobweave::llm::LlmProvider;
use jobweave::store::LibSqlBackend;
use jobweave::tools::ToolRegistry;

/// Maximum time any test waits for a job before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        queue: QueueConfig {
            lease: Duration::from_secs(5),
            max_receive: 5,
            retry_base: Duration::from_millis(50),
            retry_max: Duration::from_millis(200),
        },
        worker: WorkerConfig {
            concurrency: 4,
            poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(2),
            job_timeout: Duration::from_secs(10),
        },
        probe: ProbeConfig {
            initial_delay: Duration::from_millis(50),
            staleness: Duration::from_millis(150),
            max_age: Duration::from_secs(60),
        },
        orchestrator: OrchestratorConfig {
            poll_interval: Duration::from_millis(50),
            max_wait: Duration::from_secs(5),
            max_rounds: 2,
            max_tokens: 512,
        },
        ..EngineConfig::default()
    }
}

/// Serves a fixed link graph and counts fetches per URL. Selected URLs fail
/// transiently a number of times, or permanently.
#[derive(Default)]
pub struct FakeFetcher {
    links: HashMap<String, Vec<String>>,
    fetches: Mutex<HashMap<String, usize>>,
    transient: HashMap<String, usize>,
    permanent: HashSet<String>,
}

impl FakeFetcher {
    pub fn new(graph: &[(&str, &[&str])]) -> Self {
        Self {
            links: graph
                .iter()
                .map(|(url, links)| {
                    (url.to_string(), links.iter().map(|l| l.to_string()).collect())
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Fail the first `times` fetches of `url` with a transient error.
    pub fn flaky(mut self, url: &str, times: usize) -> Self {
        self.transient.insert(url.to_string(), times);
        self
    }

    /// Fail every fetch of `url` with a permanent error.
    pub fn gone(mut self, url: &str) -> Self {
        self.permanent.insert(url.to_string());
        self
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let attempt = {
            let mut fetches = self.fetches.lock().unwrap();
            let count = fetches.entry(url.to_string()).or_default();
            *count += 1;
            *count
        };
        if self.permanent.contains(url) {
            return Err(FetchError::Permanent(format!("HTTP 404 for {url}")));
        }
        if self.transient.get(url).is_some_and(|times| attempt <= *times) {
            return Err(FetchError::Transient(format!("HTTP 503 for {url}")));
        }
        let links = self.links.get(url).cloned().unwrap_or_default();
        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            title: Some(format!("Page {url}")),
            body: format!("<html><body>content of {url}</body></html>"),
            links,
        })
    }
}

/// Parks fetches of one URL until the test releases them.
pub struct GatedFetcher {
    inner: FakeFetcher,
    gated: String,
    arrived: Notify,
    release: Notify,
}

impl GatedFetcher {
    pub fn new(inner: FakeFetcher, gated: &str) -> Self {
        Self {
            inner,
            gated: gated.to_string(),
            arrived: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Wait until a fetch of the gated URL is parked.
    pub async fn arrived(&self) {
        tokio::time::timeout(TEST_TIMEOUT, self.arrived.notified())
            .await
            .expect("gated fetch never started");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.inner.fetch_count(url)
    }
}

#[async_trait]
impl PageFetcher for GatedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        if url == self.gated {
            self.arrived.notify_one();
            self.release.notified().await;
        }
        self.inner.fetch(url).await
    }
}

pub async fn backend() -> Arc<LibSqlBackend> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

pub fn engine(
    backend: Arc<LibSqlBackend>,
    fetcher: Arc<dyn PageFetcher>,
    llm: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
) -> Engine {
    engine_with(fast_config(), backend, fetcher, llm, tools, Vec::new())
}

pub fn engine_with(
    config: EngineConfig,
    backend: Arc<LibSqlBackend>,
    fetcher: Arc<dyn PageFetcher>,
    llm: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
    actions: Vec<Arc<dyn StepActionHandler>>,
) -> Engine {
    Engine::new(
        config,
        backend,
        EngineDeps {
            fetcher,
            llm,
            tools,
            actions,
        },
    )
}

/// Engine over a plain link graph with no LLM and no tools.
pub fn crawl_engine(backend: Arc<LibSqlBackend>, fetcher: Arc<dyn PageFetcher>) -> Engine {
    engine(backend, fetcher, None, Arc::new(ToolRegistry::new()))
}

pub fn definition(value: serde_json::Value) -> JobDefinition {
    serde_json::from_value(value).unwrap()
}

/// Poll until the job is terminal.
pub async fn wait_terminal(engine: &Engine, id: Uuid) -> JobRecord {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Some(record) = engine.runtime.store.get_job(id).await.unwrap()
            && record.status().is_terminal()
        {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until `check` holds for the job.
pub async fn wait_for(engine: &Engine, id: Uuid, check: impl Fn(&JobRecord) -> bool) -> JobRecord {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Some(record) = engine.runtime.store.get_job(id).await.unwrap()
            && check(&record)
        {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} never reached the expected state"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
