//! End-to-end runs of crawl definitions through the real queue, worker pool
//! and completion probe.

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use jobweave::documents::DocumentSink;
use jobweave::error::{Error, JobError};
use jobweave::events::JobEvent;
use jobweave::handlers::CrawlPageHandler;
use jobweave::jobs::config::{CrawlPageConfig, JobConfig};
use jobweave::jobs::{Job, JobStatus, child_id};
use jobweave::tools::ToolRegistry;
use jobweave::worker::{WorkContext, WorkHandler};

use common::*;

const A: &str = "https://site.test/a";
const B: &str = "https://site.test/b";
const C: &str = "https://site.test/c";
const SHARED: &str = "https://site.test/shared";

fn link_graph() -> FakeFetcher {
    FakeFetcher::new(&[
        (A, &["https://site.test/a/1", SHARED, "https://elsewhere.test/x"]),
        (B, &["https://site.test/b/1", SHARED]),
        (C, &["https://site.test/c/1", SHARED, A]),
        // Depth 1 pages link further; max_depth 1 must stop there.
        ("https://site.test/a/1", &["https://site.test/a/2"]),
        (SHARED, &["https://site.test/deeper"]),
    ])
}

#[tokio::test]
async fn crawl_then_reindex_then_post_job() {
    let backend = backend().await;
    let fetcher = Arc::new(link_graph());
    let engine = engine(
        backend.clone(),
        fetcher.clone(),
        None,
        Arc::new(ToolRegistry::new()),
    );

    let notify = definition(json!({
        "id": "notify-done",
        "name": "Notify",
        "steps": [{"name": "send", "action": "notify", "message": "crawl finished", "channel": "ops"}]
    }));
    let crawl = definition(json!({
        "id": "site",
        "name": "Crawl site",
        "steps": [
            {"name": "crawl", "action": "crawl", "seeds": [A, B, C], "max_depth": 1},
            {"name": "reindex", "action": "reindex"}
        ],
        "post_jobs": ["notify-done"]
    }));
    engine.executor.save_definition(&notify).await.unwrap();
    engine.executor.save_definition(&crawl).await.unwrap();

    let mut events = engine.runtime.events.subscribe();
    let notifications = tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(JobEvent::Notification { message, channel, .. }) => {
                    seen.push((message, channel));
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        seen
    });

    engine.start().await.unwrap();
    let manager_id = engine.executor.execute("site").await.unwrap();
    let manager = wait_terminal(&engine, manager_id).await;
    assert_eq!(manager.status(), JobStatus::Completed, "{:?}", manager.state.error);

    // Seeds a, b, c plus a/1, b/1, c/1 and shared. The off-host link and
    // depth-2 pages are not followed, and each page is fetched once.
    let crawl_step = engine
        .runtime
        .load(child_id(manager_id, "step:0:crawl"))
        .await
        .unwrap();
    assert_eq!(crawl_step.status(), JobStatus::Completed);
    assert_eq!(crawl_step.state.progress.total, 7);
    assert_eq!(crawl_step.state.progress.completed, 7);
    assert_eq!(crawl_step.state.progress.active(), 0);
    assert!(!crawl_step.state.meta_bool("possibly_incomplete"));
    assert_eq!(fetcher.total_fetches(), 7);
    assert_eq!(fetcher.fetch_count(SHARED), 1);
    assert_eq!(fetcher.fetch_count("https://site.test/deeper"), 0);
    assert_eq!(fetcher.fetch_count("https://elsewhere.test/x"), 0);
    assert_eq!(backend.document_count().await.unwrap(), 7);

    let reindex = engine
        .runtime
        .load(child_id(manager_id, "step:1:reindex"))
        .await
        .unwrap();
    assert_eq!(reindex.status(), JobStatus::Completed);
    assert_eq!(reindex.state.result.as_ref().unwrap()["documents"], 7);

    // The manager counts the same work descendants as the step.
    assert_eq!(manager.state.progress.total, 7);
    let post = manager.state.result.as_ref().unwrap()["post_jobs"].clone();
    assert_eq!(post.as_array().map(|a| a.len()), Some(1));

    let post_id = child_id(manager_id, "post:notify-done");
    let post_run = wait_terminal(&engine, post_id).await;
    assert_eq!(post_run.status(), JobStatus::Completed);
    assert_eq!(post_run.state.metadata["triggered_by"], json!(manager_id));

    let seen = tokio::time::timeout(TEST_TIMEOUT, notifications)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, vec![("crawl finished".to_string(), Some("ops".to_string()))]);

    engine.stop().await;
}

#[tokio::test]
async fn redelivered_page_creates_no_duplicate_children() {
    let backend = backend().await;
    let fetcher = Arc::new(link_graph());
    let engine = engine(
        backend.clone(),
        fetcher.clone(),
        None,
        Arc::new(ToolRegistry::new()),
    );
    let def = definition(json!({
        "id": "site",
        "name": "Crawl site",
        "steps": [{"name": "crawl", "action": "crawl", "seeds": [A], "max_depth": 1}]
    }));
    engine.executor.validate(&def).unwrap();

    // No workers: drive the handler by hand.
    let manager_id = engine
        .executor
        .launch(&def, uuid::Uuid::new_v4(), json!({}))
        .await
        .unwrap();
    let step = engine
        .runtime
        .load(child_id(manager_id, "step:0:crawl"))
        .await
        .unwrap();
    let page = Job::child_of(
        &step.job,
        child_id(step.id(), A),
        A,
        JobConfig::CrawlPage(CrawlPageConfig {
            url: A.to_string(),
            depth: 0,
            max_depth: 1,
            max_pages: 100,
            include: vec![],
            exclude: vec![],
            host: Some("site.test".to_string()),
        }),
    );
    assert!(engine.runtime.spawn_work(&page).await.unwrap());

    let handler = CrawlPageHandler::new(fetcher.clone(), backend.clone());
    for attempt in 1..=2 {
        let ctx = WorkContext {
            runtime: engine.runtime.clone(),
            record: engine.runtime.load(page.id).await.unwrap(),
            attempt,
        };
        handler.run(&ctx).await.unwrap();
    }

    let children = engine.runtime.store.list_children(step.id()).await.unwrap();
    // The seed plus a/1 and shared; the off-host link is filtered.
    assert_eq!(children.len(), 3);
    let step = engine.runtime.load(step.id()).await.unwrap();
    assert_eq!(step.state.progress.total, 3);
    assert_eq!(fetcher.fetch_count(A), 2);
    assert_eq!(backend.document_count().await.unwrap(), 1);

    // One work message per page, however often the parent ran.
    let queued = engine.runtime.queue.depth().await.unwrap();
    assert_eq!(queued, 4, "advance + seed + two discovered pages");
}

#[tokio::test]
async fn page_budget_caps_discovery() {
    let backend = backend().await;
    let fetcher = Arc::new(link_graph());
    let engine = engine(
        backend.clone(),
        fetcher.clone(),
        None,
        Arc::new(ToolRegistry::new()),
    );
    let def = definition(json!({
        "id": "small",
        "name": "Small crawl",
        "steps": [{"name": "crawl", "action": "crawl", "seeds": [A], "max_depth": 1, "max_pages": 2}]
    }));
    engine.executor.save_definition(&def).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("small").await.unwrap();
    let manager = wait_terminal(&engine, manager_id).await;
    assert_eq!(manager.status(), JobStatus::Completed);

    let step = engine
        .runtime
        .load(child_id(manager_id, "step:0:crawl"))
        .await
        .unwrap();
    // The seed plus one of its two on-host links.
    assert_eq!(step.state.progress.total, 2);
    assert_eq!(step.state.progress.completed, 2);
    assert_eq!(fetcher.total_fetches(), 2);

    engine.stop().await;
}

fn crawl_def(id: &str, seeds: &[&str]) -> jobweave::jobs::JobDefinition {
    definition(json!({
        "id": id,
        "name": "Crawl",
        "steps": [{"name": "crawl", "action": "crawl", "seeds": seeds, "max_depth": 1}]
    }))
}

#[tokio::test]
async fn page_cancelled_mid_fetch_follows_no_links() {
    let backend = backend().await;
    let fetcher = Arc::new(GatedFetcher::new(FakeFetcher::new(&[(A, &[B, C])]), A));
    let engine = crawl_engine(backend.clone(), fetcher.clone());
    engine.executor.save_definition(&crawl_def("site", &[A])).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("site").await.unwrap();
    let step_id = child_id(manager_id, "step:0:crawl");
    let page_id = child_id(step_id, A);
    fetcher.arrived().await;

    assert_eq!(engine.service.cancel(page_id).await.unwrap(), 1);
    fetcher.release();

    // The step still completes, with only the cancelled seed under it.
    let manager = wait_terminal(&engine, manager_id).await;
    engine.stop().await;
    assert_eq!(manager.status(), JobStatus::Completed);

    let page = engine.runtime.load(page_id).await.unwrap();
    assert_eq!(page.status(), JobStatus::Cancelled);
    assert!(page.state.result.is_none(), "output of a cancelled page is dropped");
    let children = engine.runtime.store.list_children(step_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert!(
        engine
            .runtime
            .store
            .get_job(child_id(step_id, B))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(fetcher.fetch_count(B), 0);

    let step = engine.runtime.load(step_id).await.unwrap();
    assert_eq!(step.status(), JobStatus::Completed);
    assert_eq!(step.state.progress.cancelled, 1);
}

#[tokio::test]
async fn cancelling_a_running_crawl_stops_discovery() {
    let backend = backend().await;
    let fetcher = Arc::new(GatedFetcher::new(FakeFetcher::new(&[(A, &[B, C])]), A));
    let engine = crawl_engine(backend.clone(), fetcher.clone());
    engine.executor.save_definition(&crawl_def("site", &[A])).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("site").await.unwrap();
    let step_id = child_id(manager_id, "step:0:crawl");
    fetcher.arrived().await;

    // Manager, step and the running seed.
    assert_eq!(engine.service.cancel(manager_id).await.unwrap(), 3);
    fetcher.release();
    engine.stop().await;

    for id in [manager_id, step_id, child_id(step_id, A)] {
        let record = engine.runtime.load(id).await.unwrap();
        assert_eq!(record.status(), JobStatus::Cancelled, "{}", record.job.name);
    }
    assert_eq!(
        engine.runtime.store.list_children(step_id).await.unwrap().len(),
        1
    );
    assert_eq!(fetcher.fetch_count(B) + fetcher.fetch_count(C), 0);
    assert_eq!(engine.runtime.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn only_finished_pages_can_be_deleted_from_a_running_crawl() {
    let backend = backend().await;
    let fetcher = Arc::new(GatedFetcher::new(FakeFetcher::new(&[(A, &[B])]), B));
    let engine = crawl_engine(backend.clone(), fetcher.clone());
    engine.executor.save_definition(&crawl_def("site", &[A])).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("site").await.unwrap();
    let step_id = child_id(manager_id, "step:0:crawl");
    let (page_a, page_b) = (child_id(step_id, A), child_id(step_id, B));
    fetcher.arrived().await;
    wait_terminal(&engine, page_a).await;

    for id in [page_b, step_id, manager_id] {
        let err = engine.service.delete(id).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Active { .. })), "{err}");
    }

    // Deleting the finished seed recounts the step and the manager.
    assert_eq!(engine.service.delete(page_a).await.unwrap(), 1);
    let step = engine.runtime.load(step_id).await.unwrap();
    assert_eq!(step.status(), JobStatus::Running);
    assert_eq!(step.state.progress.total, 1);
    assert_eq!(step.state.progress.completed, 0);
    assert_eq!(step.state.progress.active(), 1);

    fetcher.release();
    let manager = wait_terminal(&engine, manager_id).await;
    engine.stop().await;
    assert_eq!(manager.status(), JobStatus::Completed);
    assert_eq!(manager.state.progress.total, 1);
    assert_eq!(manager.state.progress.completed, 1);
    let step = engine.runtime.load(step_id).await.unwrap();
    assert_eq!(step.status(), JobStatus::Completed);
}

#[tokio::test]
async fn failed_pages_are_retried_or_failed_by_error_kind() {
    const FLAKY: &str = "https://site.test/flaky";
    const BROKEN: &str = "https://site.test/broken";
    const GONE: &str = "https://site.test/gone";

    let backend = backend().await;
    let fetcher = Arc::new(
        FakeFetcher::new(&[(A, &[])])
            .flaky(FLAKY, 2)
            .flaky(BROKEN, usize::MAX)
            .gone(GONE),
    );
    let engine = crawl_engine(backend.clone(), fetcher.clone());
    engine
        .executor
        .save_definition(&crawl_def("site", &[A, FLAKY, BROKEN, GONE]))
        .await
        .unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("site").await.unwrap();
    let manager = wait_terminal(&engine, manager_id).await;
    engine.stop().await;
    // Failed pages do not fail a crawl.
    assert_eq!(manager.status(), JobStatus::Completed);

    let step_id = child_id(manager_id, "step:0:crawl");
    let page = |url: &'static str| {
        let runtime = engine.runtime.clone();
        async move { runtime.load(child_id(step_id, url)).await.unwrap() }
    };

    // Transient errors are redelivered until they succeed.
    assert_eq!(page(FLAKY).await.status(), JobStatus::Completed);
    assert_eq!(fetcher.fetch_count(FLAKY), 3);

    // ...or until the queue gives up on the message.
    let broken = page(BROKEN).await;
    assert_eq!(broken.status(), JobStatus::Failed);
    assert_eq!(broken.state.metadata["error_code"], "dead_lettered");
    assert_eq!(fetcher.fetch_count(BROKEN), 5);

    // Permanent errors fail on the first delivery.
    let gone = page(GONE).await;
    assert_eq!(gone.status(), JobStatus::Failed);
    assert!(gone.state.error.as_deref().is_some_and(|e| e.contains("404")));
    assert!(gone.state.metadata.get("error_code").is_none());
    assert_eq!(fetcher.fetch_count(GONE), 1);

    let step = engine.runtime.load(step_id).await.unwrap();
    assert_eq!(step.state.progress.total, 4);
    assert_eq!(step.state.progress.completed, 2);
    assert_eq!(step.state.progress.failed, 2);
}

#[tokio::test]
async fn timed_out_crawl_step_can_be_skipped() {
    let backend = backend().await;
    let fetcher = Arc::new(GatedFetcher::new(FakeFetcher::new(&[(A, &[])]), A));
    let engine = crawl_engine(backend.clone(), fetcher.clone());
    let def = definition(json!({
        "id": "site",
        "name": "Crawl then notify",
        "steps": [
            {"name": "crawl", "action": "crawl", "seeds": [A], "timeout_secs": 1, "on_error": "continue"},
            {"name": "announce", "action": "notify", "message": "done anyway"}
        ]
    }));
    engine.executor.save_definition(&def).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("site").await.unwrap();
    fetcher.arrived().await;
    let manager = wait_terminal(&engine, manager_id).await;
    fetcher.release();
    engine.stop().await;
    assert_eq!(manager.status(), JobStatus::Completed, "{:?}", manager.state.error);

    let step_id = child_id(manager_id, "step:0:crawl");
    let step = engine.runtime.load(step_id).await.unwrap();
    assert_eq!(step.status(), JobStatus::Failed);
    assert_eq!(step.state.error.as_deref(), Some("step timed out"));
    assert_eq!(step.state.metadata["error_code"], "timeout");
    assert!(step.state.meta_bool("skipped"));
    assert_eq!(
        engine.runtime.load(child_id(step_id, A)).await.unwrap().status(),
        JobStatus::Cancelled
    );

    let announce = engine
        .runtime
        .load(child_id(manager_id, "step:1:announce"))
        .await
        .unwrap();
    assert_eq!(announce.status(), JobStatus::Completed);
}

#[tokio::test]
async fn stranded_pages_are_cancelled_at_max_age() {
    let backend = backend().await;
    let fetcher = Arc::new(GatedFetcher::new(FakeFetcher::new(&[(A, &[])]), A));
    let mut config = fast_config();
    config.probe.max_age = std::time::Duration::from_secs(1);
    let engine = engine_with(
        config,
        backend.clone(),
        fetcher.clone(),
        None,
        Arc::new(ToolRegistry::new()),
        Vec::new(),
    );
    engine.executor.save_definition(&crawl_def("site", &[A])).await.unwrap();
    engine.start().await.unwrap();

    let manager_id = engine.executor.execute("site").await.unwrap();
    fetcher.arrived().await;
    let manager = wait_terminal(&engine, manager_id).await;
    fetcher.release();
    engine.stop().await;
    assert_eq!(manager.status(), JobStatus::Completed);

    let step_id = child_id(manager_id, "step:0:crawl");
    let step = engine.runtime.load(step_id).await.unwrap();
    assert_eq!(step.status(), JobStatus::Completed);
    assert!(step.state.meta_bool("possibly_incomplete"));
    assert_eq!(
        engine.runtime.load(child_id(step_id, A)).await.unwrap().status(),
        JobStatus::Cancelled
    );
}
