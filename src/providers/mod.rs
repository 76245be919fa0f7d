//! Uniform provider capability and the process-wide registry.
//!
//! Each adapter speaks its provider's wire format and exposes the same
//! four-method surface. Providers without credentials are simply never
//! registered; the registry itself does no fallback — that lives in the
//! routing service.

pub mod anthropic;
pub mod mock;
pub mod openai;
pub mod router;

pub use anthropic::AnthropicProvider;
pub use mock::MockProvider;
pub use openai::OpenAiProvider;
pub use router::RoutingService;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::ProvidersConfig;
use crate::errors::AppError;
use crate::models::inference::{ChatRequest, ChatResponse};

/// Provider failures keep the retryable/fatal distinction end to end; the
/// HTTP layer surfaces it in the 502 payload.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        let retryable = e.is_retryable();
        AppError::Provider {
            message: e.to_string(),
            retryable,
        }
    }
}

/// Pricing is USD per million tokens, the unit provider price sheets quote.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInfo {
    pub input_cost_per_m: Decimal,
    pub output_cost_per_m: Decimal,
    pub context_limit: u32,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Cheap liveness hint consulted during routing.
    async fn is_available(&self) -> bool;

    /// `None` means the provider does not serve this model.
    fn model_info(&self, model: &str) -> Option<ModelInfo>;
}

pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Build from configuration, registering only providers with credentials.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let registry = Self::new();
        if let Some(cfg) = &config.openai {
            registry.register(Arc::new(OpenAiProvider::new(cfg)));
        }
        if let Some(cfg) = &config.anthropic {
            registry.register(Arc::new(AnthropicProvider::new(cfg)));
        }
        registry
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn list(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.providers.len()
    }

    /// Lowest advertised input price for a model across every registered
    /// provider. Used as the admission-biased estimation floor.
    pub fn price_floor(&self, model: &str) -> Option<Decimal> {
        self.providers
            .iter()
            .filter_map(|entry| entry.model_info(model))
            .map(|info| info.input_cost_per_m)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_get_list() {
        let registry = ProviderRegistry::new();
        assert_eq!(registry.count(), 0);

        registry.register(Arc::new(MockProvider::named("alpha")));
        registry.register(Arc::new(MockProvider::named("beta")));

        assert_eq!(registry.count(), 2);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("gamma").is_none());
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::Retryable("503".into()).is_retryable());
        assert!(!ProviderError::Fatal("bad model".into()).is_retryable());

        let app: AppError = ProviderError::Retryable("overloaded".into()).into();
        match app {
            AppError::Provider { retryable, .. } => assert!(retryable),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_price_floor_minimum_across_providers() {
        use std::str::FromStr;
        let registry = ProviderRegistry::new();
        let expensive = MockProvider::named("pricey")
            .with_pricing("shared-model", Decimal::from_str("10").unwrap());
        let cheap = MockProvider::named("cheap")
            .with_pricing("shared-model", Decimal::from_str("2").unwrap());
        registry.register(Arc::new(expensive));
        registry.register(Arc::new(cheap));

        assert_eq!(
            registry.price_floor("shared-model"),
            Some(Decimal::from_str("2").unwrap())
        );
        assert_eq!(registry.price_floor("unknown-model"), None);
    }
}
