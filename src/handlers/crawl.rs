//! `crawl_page` work jobs: fetch one page, store it, fan out to its links.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Url;
use serde_json::json;
use tracing::debug;

use crate::documents::{Document, DocumentSink};
use crate::error::HandlerError;
use crate::jobs::config::{CrawlPageConfig, JobConfig};
use crate::jobs::model::{Job, child_id};
use crate::worker::{WorkContext, WorkHandler, WorkOutput};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title pattern")
});

static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']+)["']"#).expect("valid href pattern")
});

/// A fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub title: Option<String>,
    pub body: String,
    /// Absolute http(s) links found on the page, deduplicated.
    pub links: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Worth another delivery: network trouble, 5xx, 429.
    #[error("fetch failed: {0}")]
    Transient(String),

    #[error("fetch failed: {0}")]
    Permanent(String),
}

impl From<FetchError> for HandlerError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Transient(_) => Self::Retryable(e.to_string()),
            FetchError::Permanent(_) => Self::Terminal(e.to_string()),
        }
    }
}

/// Fetches pages for the crawler.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// `PageFetcher` over reqwest.
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("jobweave/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpPageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed =
            Url::parse(url).map_err(|e| FetchError::Permanent(format!("invalid url {url}: {e}")))?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchError::Transient(format!("HTTP {status} from {url}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("HTTP {status} from {url}")));
        }

        let final_url = response.url().clone();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("{url}: failed to read body: {e}")))?;

        Ok(FetchedPage {
            url: final_url.to_string(),
            status: status.as_u16(),
            title: extract_title(&body),
            links: extract_links(&final_url, &body),
            body,
        })
    }
}

pub fn extract_title(body: &str) -> Option<String> {
    TITLE_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}

/// Resolve every anchor against `base`, keeping http(s) targets without
/// their fragment.
pub fn extract_links(base: &Url, body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    HREF_RE
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .filter_map(|m| base.join(m.as_str().trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|mut u| {
            u.set_fragment(None);
            u.to_string()
        })
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// Which discovered links a crawl follows.
pub struct LinkFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    host: Option<String>,
}

impl LinkFilter {
    pub fn new(config: &CrawlPageConfig) -> Result<Self, regex::Error> {
        let compile =
            |patterns: &[String]| patterns.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>();
        Ok(Self {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
            host: config.host.clone(),
        })
    }

    pub fn allows(&self, url: &str) -> bool {
        if let Some(host) = &self.host {
            let same = Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(host)))
                .unwrap_or(false);
            if !same {
                return false;
            }
        }
        if !self.include.is_empty() && !self.include.iter().any(|r| r.is_match(url)) {
            return false;
        }
        !self.exclude.iter().any(|r| r.is_match(url))
    }
}

/// Runs `crawl_page` jobs.
pub struct CrawlPageHandler {
    fetcher: Arc<dyn PageFetcher>,
    sink: Arc<dyn DocumentSink>,
}

impl CrawlPageHandler {
    pub fn new(fetcher: Arc<dyn PageFetcher>, sink: Arc<dyn DocumentSink>) -> Self {
        Self { fetcher, sink }
    }
}

#[async_trait]
impl WorkHandler for CrawlPageHandler {
    fn job_type(&self) -> &'static str {
        "crawl_page"
    }

    async fn run(&self, ctx: &WorkContext) -> Result<WorkOutput, HandlerError> {
        let job = &ctx.record.job;
        let JobConfig::CrawlPage(config) = &job.config else {
            return Err(HandlerError::Terminal(format!(
                "job {} is not a crawl_page job",
                job.id
            )));
        };

        let page = self.fetcher.fetch(&config.url).await?;
        self.sink
            .save_document(&Document {
                url: config.url.clone(),
                title: page.title.clone(),
                body: page.body.clone(),
                job_id: Some(job.id),
                fetched_at: Utc::now(),
            })
            .await?;

        let mut followed = 0;
        if config.depth < config.max_depth {
            followed = self.follow_links(ctx, config, &page.links).await?;
        }

        Ok(WorkOutput::with_result(
            json!({
                "url": config.url,
                "status": page.status,
                "title": page.title,
                "links_found": page.links.len(),
                "links_followed": followed,
            }),
            1,
        ))
    }
}

impl CrawlPageHandler {
    /// Create child pages under the step. Ids derive from the step and URL,
    /// so a page reached twice is fetched once.
    async fn follow_links(
        &self,
        ctx: &WorkContext,
        config: &CrawlPageConfig,
        links: &[String],
    ) -> Result<usize, HandlerError> {
        let runtime = &ctx.runtime;
        let own = runtime.store.get_job(ctx.record.id()).await?;
        if own.is_none_or(|r| r.status().is_terminal()) {
            debug!(job_id = %ctx.record.id(), "Page cancelled mid-fetch, not following links");
            return Ok(0);
        }
        let Some(step) = runtime.step_of(&ctx.record.job).await? else {
            return Ok(0);
        };
        if step.status().is_terminal() {
            debug!(job_id = %ctx.record.id(), "Step already finished, not following links");
            return Ok(0);
        }

        let filter = LinkFilter::new(config)
            .map_err(|e| HandlerError::Terminal(format!("bad link pattern: {e}")))?;
        let mut total = step.state.progress.total;
        let mut followed = 0;

        for link in links.iter().filter(|l| filter.allows(l)) {
            if total >= config.max_pages as i64 {
                debug!(job_id = %step.id(), max_pages = config.max_pages, "Page budget reached");
                break;
            }
            let child = Job::child_of(
                &step.job,
                child_id(step.id(), link),
                link.clone(),
                JobConfig::CrawlPage(CrawlPageConfig {
                    url: link.clone(),
                    depth: config.depth + 1,
                    ..config.clone()
                }),
            );
            if runtime.spawn_work(&child).await? {
                total += 1;
                followed += 1;
            }
        }
        Ok(followed)
    }
}
