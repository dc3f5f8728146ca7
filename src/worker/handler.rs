//! Message handler trait and registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::queue::Lease;

/// What the pool should do with a message after a successful run.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Acknowledge and drop the message.
    Done,
    /// Run the message again after `delay`, optionally with new state.
    Reschedule {
        delay: Duration,
        payload: Option<serde_json::Value>,
    },
}

impl HandlerOutcome {
    pub fn after(delay: Duration) -> Self {
        Self::Reschedule {
            delay,
            payload: None,
        }
    }

    pub fn after_with(delay: Duration, payload: serde_json::Value) -> Self {
        Self::Reschedule {
            delay,
            payload: Some(payload),
        }
    }
}

/// Processes messages of one kind.
///
/// Handlers must tolerate redelivery: a message can run again after a crash
/// or an expired lease, so every side effect has to be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Message kind this handler consumes.
    fn kind(&self) -> &str;

    async fn handle(&self, lease: &Lease) -> Result<HandlerOutcome, HandlerError>;
}

/// Handlers keyed by message kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        let kind = handler.kind().to_string();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::warn!(kind = %kind, "Replaced message handler");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl MessageHandler for Noop {
        fn kind(&self) -> &str {
            self.0
        }

        async fn handle(&self, _lease: &Lease) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Done)
        }
    }

    #[test]
    fn registry_routes_by_kind() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Noop("probe")));
        registry.register(Arc::new(Noop("advance")));

        assert!(registry.has("probe"));
        assert!(registry.get("crawl_page").is_none());
        assert_eq!(registry.kinds(), vec!["advance", "probe"]);
    }
}
