//! Provider fallback — ordered chain with per-provider timeouts.
//!
//! Planning and synthesis calls go through this when `fallback_providers` is
//! configured: a failure (error, rate limit, timeout) moves on to the next
//! provider; the error of the last one is returned when all fail.

use async_trait::async_trait;
use merlin_core::error::ProviderError;
use merlin_core::provider::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A provider that wraps an ordered list of providers and falls back on failure.
pub struct FallbackProvider {
    name: String,
    chain: Vec<(Arc<dyn Provider>, Duration)>,
}

impl FallbackProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: Vec::new(),
        }
    }

    /// Append a provider with its own timeout.
    pub fn add(mut self, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        self.chain.push((provider, timeout));
        self
    }

    /// Append a provider with the default timeout (120s).
    pub fn add_default(self, provider: Arc<dyn Provider>) -> Self {
        self.add(provider, Duration::from_secs(120))
    }

    /// Names of the chained providers, in order.
    pub fn members(&self) -> Vec<&str> {
        self.chain.iter().map(|(p, _)| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[async_trait]
impl Provider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let mut last_error = ProviderError::NotConfigured("No providers in fallback chain".into());

        for (i, (provider, timeout)) in self.chain.iter().enumerate() {
            debug!(provider = provider.name(), attempt = i + 1, total = self.chain.len(), "Trying provider");

            last_error = match tokio::time::timeout(*timeout, provider.complete(request.clone())).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(format!(
                    "Provider '{}' timed out after {}ms",
                    provider.name(),
                    timeout.as_millis()
                )),
            };
            warn!(provider = provider.name(), error = %last_error, "Provider failed, trying next");
        }

        Err(last_error)
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let mut all_models = Vec::new();
        for (provider, _) in &self.chain {
            if let Ok(models) = provider.list_models().await {
                all_models.extend(models);
            }
        }
        Ok(all_models)
    }

    /// Healthy when any member is.
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        for (provider, _) in &self.chain {
            if let Ok(true) = provider.health_check().await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
