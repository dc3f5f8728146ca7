use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use jobweave::config::EngineConfig;
use jobweave::engine::{Engine, EngineDeps};
use jobweave::handlers::HttpPageFetcher;
use jobweave::jobs::definition;
use jobweave::llm::create_provider;
use jobweave::scheduler::spawn_cron_ticker;
use jobweave::store::LibSqlBackend;
use jobweave::tools::{HttpFetchTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("jobweave v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Workers: {}", config.worker.concurrency);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // ── Tools & LLM ──────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    tools.register_sync(Arc::new(HttpFetchTool::new()));

    let llm = match create_provider(&config.llm) {
        Ok(provider) => {
            eprintln!("   Orchestrator: enabled (model {})", provider.model_name());
            Some(provider)
        }
        Err(e) => {
            tracing::warn!("LLM provider unavailable, orchestrate steps disabled: {}", e);
            eprintln!("   Orchestrator: disabled (set ANTHROPIC_API_KEY to enable)");
            None
        }
    };

    let definitions_dir = config.definitions_dir.clone();
    let cron_interval = config.cron_interval;
    let engine = Engine::new(
        config,
        backend,
        EngineDeps {
            fetcher: Arc::new(HttpPageFetcher::new()),
            llm,
            tools,
            actions: Vec::new(),
        },
    );

    // ── Definitions ──────────────────────────────────────────────────────
    if let Some(dir) = &definitions_dir {
        let definitions = definition::load_dir(dir)
            .await
            .with_context(|| format!("loading definitions from {}", dir.display()))?;
        for def in &definitions {
            engine
                .executor
                .save_definition(def)
                .await
                .with_context(|| format!("saving definition {}", def.id))?;
        }
        eprintln!("   Definitions: {} loaded from {}", definitions.len(), dir.display());
    }

    // ── Start ────────────────────────────────────────────────────────────
    let report = engine.start().await.context("starting engine")?;
    if report.managers + report.probes + report.orchestrators + report.work > 0 {
        eprintln!(
            "   Recovered: {} runs, {} probes, {} orchestrators, {} work jobs",
            report.managers, report.probes, report.orchestrators, report.work
        );
    }
    let cron_handle = spawn_cron_ticker(engine.scheduler.clone(), cron_interval);

    // Definition ids on the command line run once at startup.
    for id in std::env::args().skip(1) {
        match engine.executor.execute(&id).await {
            Ok(job_id) => eprintln!("   Started {id} as {job_id}"),
            Err(e) => eprintln!("   Failed to start {id}: {e}"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    eprintln!("Shutting down...");
    cron_handle.abort();
    engine.stop().await;
    Ok(())
}

/// stderr logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when a log directory is configured.
fn init_tracing(config: &EngineConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "jobweave.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
