//! `http_fetch`: GET a URL and return status and body.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::jobs::model::truncate;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Default cap on the returned body.
const DEFAULT_MAX_BYTES: usize = 64 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET. Returns the status code, content type and \
         the (possibly truncated) response body."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http(s) URL to fetch"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Maximum body size to return (default 65536)"
                }
            },
            "required": ["url"]
        })
    }

    fn timeout(&self) -> Duration {
        FETCH_TIMEOUT
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let url = require_str(&params, "url")?;
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ToolError::InvalidParameters(format!("invalid url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ToolError::InvalidParameters(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        let max_bytes = params
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_BYTES);

        let start = Instant::now();
        let response = self
            .client
            .get(parsed)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(FETCH_TIMEOUT)
                } else {
                    ToolError::ExecutionFailed(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "HTTP {status} from {url}"
            )));
        }

        let truncated = body.len() > max_bytes;
        let result = serde_json::json!({
            "url": url,
            "status": status.as_u16(),
            "content_type": content_type,
            "body": truncate(&body, max_bytes),
            "truncated": truncated,
        });
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}
