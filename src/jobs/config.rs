//! Typed job configs.
//!
//! Each job type carries its own config shape. Unknown types fail when the
//! config is deserialized, so a job with a bad config is never created.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::definition::{JobDefinition, StepDefinition};

/// How a step job reaches a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// The action runs in the advance handler and the step finishes with it.
    Inline,
    /// Work children are enqueued and the completion probe decides.
    Probe,
    /// The step's own handler drives it to completion.
    SelfManaged,
}

/// Per-type job config, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobConfig {
    /// Root of a definition run; holds the definition snapshot.
    Manager { definition: JobDefinition },
    /// One step of the manager's definition.
    Step {
        index: usize,
        step: StepDefinition,
        completion: CompletionMode,
    },
    CrawlPage(CrawlPageConfig),
    ToolCall(ToolCallConfig),
    /// Record of one planner call.
    Planning { round: u32 },
    /// Record of one reviewer call.
    Review { round: u32 },
}

impl JobConfig {
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::Manager { .. } => "manager",
            Self::Step { .. } => "step",
            Self::CrawlPage(_) => "crawl_page",
            Self::ToolCall(_) => "tool_call",
            Self::Planning { .. } => "planning",
            Self::Review { .. } => "review",
        }
    }

    pub fn as_step(&self) -> Option<(usize, &StepDefinition, CompletionMode)> {
        match self {
            Self::Step {
                index,
                step,
                completion,
            } => Some((*index, step, *completion)),
            _ => None,
        }
    }

    pub fn as_definition(&self) -> Option<&JobDefinition> {
        match self {
            Self::Manager { definition } => Some(definition),
            _ => None,
        }
    }
}

/// Config of a single page fetch in a crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlPageConfig {
    pub url: String,
    /// Link distance from a seed.
    pub depth: u32,
    pub max_depth: u32,
    pub max_pages: u32,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Host discovered links must stay on, when restricted.
    #[serde(default)]
    pub host: Option<String>,
}

/// Config of one planned tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallConfig {
    /// Id of the call inside the plan.
    pub call_id: String,
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub round: u32,
    /// The planning job that produced this call.
    pub plan_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_by_type() {
        let config = JobConfig::Planning { round: 2 };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], "planning");
        assert_eq!(config.job_type(), "planning");

        let bad = serde_json::json!({"type": "mystery", "round": 1});
        assert!(serde_json::from_value::<JobConfig>(bad).is_err());
    }

    #[test]
    fn crawl_page_parses_with_defaults() {
        let config: JobConfig = serde_json::from_value(serde_json::json!({
            "type": "crawl_page",
            "url": "https://example.com/",
            "depth": 0,
            "max_depth": 1,
            "max_pages": 10
        }))
        .unwrap();
        match config {
            JobConfig::CrawlPage(page) => {
                assert!(page.include.is_empty());
                assert!(page.host.is_none());
            }
            other => panic!("unexpected config {other:?}"),
        }
    }
}
