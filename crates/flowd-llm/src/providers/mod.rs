pub mod anthropic;
pub mod openai;
pub mod presets;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use flowd_core::config::ProviderConfig;
use flowd_core::error::Result;
use flowd_core::traits::CompletionProvider;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Maps model names to the provider that serves them.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_model: HashMap<String, Arc<dyn CompletionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build providers from config. The first provider listing a model serves it.
    pub fn from_config(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let provider = create_provider(config)?;
            for model in &config.models {
                if registry.by_model.contains_key(model) {
                    warn!(model = %model, provider = %config.name, "Model already served by another provider");
                    continue;
                }
                registry.by_model.insert(model.clone(), provider.clone());
            }
            info!(provider = %config.name, models = config.models.len(), "Provider registered");
        }
        Ok(registry)
    }

    pub fn register(&mut self, model: impl Into<String>, provider: Arc<dyn CompletionProvider>) {
        self.by_model.insert(model.into(), provider);
    }

    /// Register one provider for several models.
    pub fn with_models(mut self, models: &[&str], provider: Arc<dyn CompletionProvider>) -> Self {
        for model in models {
            self.register(*model, provider.clone());
        }
        self
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn CompletionProvider>> {
        self.by_model.get(model).cloned()
    }

    pub fn models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.by_model.keys().map(String::as_str).collect();
        models.sort_unstable();
        models
    }
}

/// Create a provider based on the preset name.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>> {
    Ok(match config.provider.as_str() {
        "anthropic" | "claude" => Arc::new(AnthropicProvider::from_config(config)?),
        // Everything else uses the OpenAI-compatible client
        _ => Arc::new(OpenAiProvider::from_config(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn cfg(name: &str, provider: &str, models: &[&str]) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            provider: provider.into(),
            base_url: None,
            api_key: Some("k".into()),
            models: models.iter().map(|m| m.to_string()).collect(),
            max_tokens: 256,
            temperature: 0.0,
            extra_headers: Map::new(),
        }
    }

    #[test]
    fn first_provider_wins_for_shared_model() {
        let registry = ProviderRegistry::from_config(&[
            cfg("a", "deepseek", &["deepseek-chat", "shared"]),
            cfg("b", "anthropic", &["claude-3-5-haiku", "shared"]),
        ])
        .unwrap();
        assert_eq!(registry.get("shared").unwrap().name(), "a");
        assert_eq!(registry.get("claude-3-5-haiku").unwrap().name(), "b");
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.models(), vec!["claude-3-5-haiku", "deepseek-chat", "shared"]);
    }

    #[test]
    fn misconfigured_provider_is_an_error() {
        let mut bad = cfg("a", "anthropic", &["m"]);
        bad.api_key = None;
        assert!(ProviderRegistry::from_config(&[bad]).is_err());
    }
}
