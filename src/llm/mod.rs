//! Model providers and the per-run Model Router.

pub mod command;
pub mod openai;
pub mod router;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::{ModelsSection, ProviderKind};
use crate::errors::ModelError;

pub use router::ModelRouter;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    /// Ask the provider for a JSON object response.
    pub json: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// A single LLM backend. Implementations make one attempt per call; retries,
/// backoff and failover belong to [`ModelRouter`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Providers by configured name.
pub type ProviderRegistry = BTreeMap<String, Arc<dyn ModelProvider>>;

/// Instantiate every configured provider. API keys are read per request, so
/// a missing key only fails the calls that need it.
pub fn build_providers(models: &ModelsSection) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for (name, spec) in &models.providers {
        let provider: Arc<dyn ModelProvider> = match spec.kind {
            ProviderKind::Openai => Arc::new(openai::OpenAiProvider::new(name, spec)?),
            ProviderKind::Command => Arc::new(command::CommandProvider::new(name, spec)?),
        };
        registry.insert(name.clone(), provider);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSpec;

    #[test]
    fn test_build_providers_from_defaults() {
        let registry = build_providers(&ModelsSection::default()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry["deepseek"].name(), "deepseek");
        assert_eq!(registry["kimi"].name(), "kimi");
    }

    #[test]
    fn test_build_providers_rejects_command_without_argv() {
        let mut models = ModelsSection::default();
        models.providers.insert(
            "local".into(),
            ProviderSpec {
                kind: ProviderKind::Command,
                base_url: None,
                api_key_env: None,
                command: None,
                timeout_secs: 10,
            },
        );
        assert!(build_providers(&models).is_err());
    }
}
