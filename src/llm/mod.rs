//! LLM integration.
//!
//! The orchestrator talks to an `LlmProvider`. rig-core carries the HTTP
//! transport and `RigAdapter` bridges rig's `CompletionModel` to our trait;
//! tests plug in stubs.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the configured Anthropic provider. Fails without an API key.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let Some(api_key) = config.api_key.as_ref() else {
        return Err(LlmError::AuthFailed {
            provider: "anthropic".to_string(),
        });
    };

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_requires_key() {
        let config = LlmConfig::default();
        assert!(matches!(
            create_provider(&config),
            Err(LlmError::AuthFailed { .. })
        ));
    }

    #[test]
    fn create_provider_with_key() {
        // rig clients accept any key at construction; auth fails on request.
        let config = LlmConfig {
            api_key: Some(secrecy::SecretString::from("test-key".to_string())),
            ..LlmConfig::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), config.model);
    }
}
