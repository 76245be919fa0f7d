//! Multi-tenant LLM control plane.
//!
//! The crate is organized around the inference pipeline: `auth` verifies the
//! caller, `policy` resolves what governs the request, `limits` enforces
//! rate and budget ceilings, `validation` screens content, `providers`
//! dispatches upstream, and `audit` records what happened.

pub mod api;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod providers;
pub mod scope;
pub mod store;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use audit::AuditSink;
use auth::{JwksCache, TokenValidator};
use config::Config;
use limits::{BudgetEngine, RateLimiter};
use pipeline::InferencePipeline;
use policy::{PolicyCache, PolicyEvaluator};
use providers::{ProviderRegistry, RoutingService};
use store::PgStore;

/// Shared application state handed to handlers and background jobs.
pub struct AppState {
    pub config: Config,
    pub store: PgStore,
    pub validator: TokenValidator,
    pub pipeline: InferencePipeline,
    pub audit: Arc<AuditSink>,
    pub policy_cache: Arc<PolicyCache>,
}

impl AppState {
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let store = PgStore::connect(&config.database).await?;

        let jwks = Arc::new(JwksCache::new(
            config.idp.jwks_url(),
            Duration::from_secs(config.idp.jwks_ttl_secs),
            Duration::from_secs(config.idp.jwks_timeout_secs),
        ));
        let validator =
            TokenValidator::new(config.idp.issuer(), config.idp.client_id.clone(), jwks);

        let policy_cache = Arc::new(PolicyCache::new(
            config.policy_cache.max_entries,
            Duration::from_secs(config.policy_cache.ttl_secs),
        ));
        let evaluator = PolicyEvaluator::new(store.clone(), Arc::clone(&policy_cache));

        let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
        tracing::info!(providers = ?registry.list(), "provider registry ready");
        let routing = RoutingService::new(registry);

        let rate_limiter = RateLimiter::new(store.pool().clone());
        let budget = BudgetEngine::new(store.pool().clone());

        let audit = Arc::new(AuditSink::start(
            Arc::new(store.clone()),
            config.audit.buffer_size,
            config.audit.worker_count,
            Duration::from_secs(config.audit.persist_timeout_secs),
        ));

        let pipeline = InferencePipeline::new(
            store.clone(),
            evaluator,
            rate_limiter,
            budget,
            routing,
            Arc::clone(&audit),
        );

        Ok(Arc::new(AppState {
            config,
            store,
            validator,
            pipeline,
            audit,
            policy_cache,
        }))
    }
}
