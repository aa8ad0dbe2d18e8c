//! Provider router — builds the configured LLM backends.
//!
//! Every configured provider is registered by name. [`ProviderRouter::planning_provider`]
//! returns the default provider, wrapped in a [`FallbackProvider`] when
//! `fallback_providers` lists alternates.

use std::collections::HashMap;
use std::sync::Arc;
use merlin_config::AppConfig;
use merlin_core::error::ProviderError;
use merlin_core::provider::Provider;
use crate::fallback::FallbackProvider;
use crate::openai_compat::OpenAiCompatProvider;

/// Routes LLM requests to the correct provider.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
    fallbacks: Vec<String>,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
            fallbacks: Vec::new(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Set the providers tried after the default one.
    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// The provider the planner should use.
    pub fn planning_provider(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        let primary = self
            .default()
            .ok_or_else(|| ProviderError::NotConfigured(self.default_provider.clone()))?;

        let alternates: Vec<Arc<dyn Provider>> = self
            .fallbacks
            .iter()
            .filter(|name| **name != self.default_provider)
            .filter_map(|name| {
                let found = self.get(name);
                if found.is_none() {
                    tracing::warn!(provider = %name, "Unknown fallback provider, skipping");
                }
                found
            })
            .collect();

        if alternates.is_empty() {
            return Ok(primary);
        }

        let chain = alternates
            .into_iter()
            .fold(FallbackProvider::new("fallback").add_default(primary), |chain, p| {
                chain.add_default(p)
            });
        Ok(Arc::new(chain))
    }

    /// List all registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

/// Build providers from configuration.
pub fn build_from_config(config: &AppConfig) -> ProviderRouter {
    let mut router = ProviderRouter::new(&config.default_provider)
        .with_fallbacks(config.fallback_providers.clone());

    for (name, provider_config) in &config.providers {
        let api_key = provider_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .unwrap_or_default();

        let base_url = provider_config
            .api_url
            .clone()
            .unwrap_or_else(|| default_base_url(name));

        router.register(name.clone(), Arc::new(OpenAiCompatProvider::new(name, &base_url, &api_key)));
    }

    // Fallback names without their own section get well-known defaults.
    let implicit: Vec<String> = std::iter::once(config.default_provider.clone())
        .chain(config.fallback_providers.iter().cloned())
        .collect();
    for name in implicit {
        if router.get(&name).is_none() {
            let api_key = config.api_key.clone().unwrap_or_default();
            let base_url = default_base_url(&name);
            router.register(name.clone(), Arc::new(OpenAiCompatProvider::new(&name, &base_url, &api_key)));
        }
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    if let Some(url) = provider_name.strip_prefix("custom:") {
        return url.to_string();
    }
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
