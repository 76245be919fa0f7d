//! Provider selection: routing preference, then fallbacks, then the default
//! model-name mapping. The registry holds the candidates; this service picks.

use std::sync::Arc;

use tracing::debug;

use crate::errors::AppError;
use crate::models::policy::RoutingConfig;

use super::{Provider, ProviderRegistry};

pub struct RoutingService {
    registry: Arc<ProviderRegistry>,
}

impl RoutingService {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Selection order:
    /// 1. the routing policy's primary provider, if available and serving
    ///    the model;
    /// 2. its fallback providers, in order, same conditions;
    /// 3. the default provider implied by the model name;
    /// 4. otherwise `ProviderUnavailable`.
    pub async fn provider_for_model(
        &self,
        model: &str,
        routing: Option<&RoutingConfig>,
    ) -> Result<Arc<dyn Provider>, AppError> {
        if let Some(config) = routing {
            if let Some(primary) = &config.primary_provider {
                if let Some(provider) = self.usable(primary, model).await {
                    return Ok(provider);
                }
                debug!(provider = %primary, model, "primary provider unusable, trying fallbacks");
            }
            for name in &config.fallback_providers {
                if let Some(provider) = self.usable(name, model).await {
                    debug!(provider = %name, model, "selected fallback provider");
                    return Ok(provider);
                }
            }
        }

        if let Some(default_name) = default_provider_for(model) {
            if let Some(provider) = self.usable(default_name, model).await {
                return Ok(provider);
            }
        }

        Err(AppError::ProviderUnavailable(model.to_string()))
    }

    async fn usable(&self, name: &str, model: &str) -> Option<Arc<dyn Provider>> {
        let provider = self.registry.get(name)?;
        if provider.model_info(model).is_none() {
            return None;
        }
        if !provider.is_available().await {
            return None;
        }
        Some(provider)
    }
}

/// Default provider implied by the model family.
fn default_provider_for(model: &str) -> Option<&'static str> {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("claude") {
        return Some("anthropic");
    }
    if lower.starts_with("gpt")
        || lower.starts_with("o1")
        || lower.starts_with("o3")
        || lower.starts_with("text-")
    {
        return Some("openai");
    }
    None
}
