//! Hierarchical policy resolution.
//!
//! Org, app and user scopes are fetched together, then merged per type by
//! `(level, priority)` — the highest scope level that defines a type wins
//! wholesale, with priority breaking ties inside a level. There is no
//! field-level merging across levels.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::policy::{
    BudgetConfig, InjectionGuardConfig, PiiDetectionConfig, Policy, PolicyType, RagConfig,
    RateLimitConfig, RoutingConfig,
};
use crate::store::PgStore;

use super::cache::{PolicyCache, PolicyCacheKey};

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub org_id: Uuid,
    pub app_id: Uuid,
    pub user_id: Option<Uuid>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Output of evaluation: the winning policy per type, decoded. Evaluation
/// itself never denies; downstream stages enforce the typed configs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationResult {
    pub allowed: bool,
    pub applied_policies: Vec<Uuid>,
    pub violations: Vec<String>,
    pub rate_limit: Option<RateLimitConfig>,
    pub budget: Option<BudgetConfig>,
    pub routing: Option<RoutingConfig>,
    pub pii: Option<PiiDetectionConfig>,
    pub injection: Option<InjectionGuardConfig>,
    pub rag: Option<RagConfig>,
}

pub struct PolicyEvaluator {
    store: PgStore,
    cache: Arc<PolicyCache>,
}

impl PolicyEvaluator {
    pub fn new(store: PgStore, cache: Arc<PolicyCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    #[tracing::instrument(skip(self), fields(org_id = %req.org_id, app_id = %req.app_id))]
    pub async fn evaluate(&self, req: &EvaluationRequest) -> Result<EvaluationResult, AppError> {
        let key: PolicyCacheKey = (req.org_id, req.app_id, req.user_id);

        let merged = match self.cache.get(&key) {
            Some(cached) => cached,
            None => {
                let fetched = self
                    .store
                    .policies_for_scope(req.org_id, req.app_id, req.user_id)
                    .await?;
                let merged = merge_policies(fetched);
                self.cache.set(key, merged.clone());
                Arc::new(merged)
            }
        };

        Ok(decode_configs(&merged))
    }

    /// Policy mutations must call this so stale merges never outlive a write.
    pub fn invalidate(&self, org_id: Uuid, app_id: Option<Uuid>, user_id: Option<Uuid>) {
        match (app_id, user_id) {
            (Some(app), Some(user)) => self.cache.invalidate_user(org_id, app, user),
            (Some(app), None) => self.cache.invalidate_app(org_id, app),
            _ => self.cache.invalidate_org(org_id),
        }
    }
}

/// Keep at most one enabled policy per type: the one with the greatest
/// `(scope level, priority)` pair. Input order breaks exact ties.
pub fn merge_policies(policies: Vec<Policy>) -> Vec<Policy> {
    let mut best: HashMap<PolicyType, Policy> = HashMap::new();
    for policy in policies {
        if !policy.enabled {
            continue;
        }
        match best.get(&policy.policy_type) {
            Some(current)
                if (current.scope_level(), current.priority)
                    >= (policy.scope_level(), policy.priority) => {}
            _ => {
                best.insert(policy.policy_type, policy);
            }
        }
    }
    let mut merged: Vec<Policy> = best.into_values().collect();
    // Deterministic output order for caching and audit trails.
    merged.sort_by_key(|p| p.policy_type.as_str());
    merged
}

/// Decode each winning policy into its typed config. A config that fails to
/// decode is skipped with a warning — never promoted to a violation here.
pub fn decode_configs(merged: &[Policy]) -> EvaluationResult {
    let mut result = EvaluationResult {
        allowed: true,
        ..Default::default()
    };

    for policy in merged {
        let applied = match policy.policy_type {
            PolicyType::RateLimit => {
                decode_into(policy, &mut result.rate_limit)
            }
            PolicyType::Budget => decode_into(policy, &mut result.budget),
            PolicyType::Routing => decode_into(policy, &mut result.routing),
            PolicyType::PiiDetection => decode_into(policy, &mut result.pii),
            PolicyType::InjectionGuard => decode_into(policy, &mut result.injection),
            PolicyType::Rag => decode_into(policy, &mut result.rag),
            // Retry, fallback and load-balance configs are consumed by the
            // router as opaque hints; nothing to decode at this layer yet.
            PolicyType::Retry | PolicyType::Fallback | PolicyType::LoadBalance => true,
        };
        if applied {
            result.applied_policies.push(policy.id);
        }
    }

    result
}

fn decode_into<T: DeserializeOwned>(policy: &Policy, slot: &mut Option<T>) -> bool {
    match serde_json::from_value::<T>(policy.config.clone()) {
        Ok(cfg) => {
            *slot = Some(cfg);
            true
        }
        Err(e) => {
            warn!(
                policy_id = %policy.id,
                policy_type = policy.policy_type.as_str(),
                "skipping policy with malformed config: {}",
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn policy(
        policy_type: PolicyType,
        app_id: Option<Uuid>,
        user_id: Option<Uuid>,
        priority: i32,
        enabled: bool,
        config: serde_json::Value,
    ) -> Policy {
        Policy {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            app_id,
            user_id,
            policy_type,
            config,
            priority,
            enabled,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_merge_one_policy_per_type() {
        let app = Some(Uuid::new_v4());
        let merged = merge_policies(vec![
            policy(PolicyType::RateLimit, None, None, 0, true, json!({})),
            policy(PolicyType::RateLimit, app, None, 0, true, json!({})),
            policy(PolicyType::Budget, None, None, 0, true, json!({})),
        ]);
        assert_eq!(merged.len(), 2);
        let types: Vec<_> = merged.iter().map(|p| p.policy_type).collect();
        assert!(types.contains(&PolicyType::RateLimit));
        assert!(types.contains(&PolicyType::Budget));
    }

    #[test]
    fn test_higher_scope_level_wins_wholesale() {
        let app = Some(Uuid::new_v4());
        let user = Some(Uuid::new_v4());
        let org_policy = policy(
            PolicyType::RateLimit,
            None,
            None,
            100, // high priority loses to higher level
            true,
            json!({"requests_per_minute": 10}),
        );
        let user_policy = policy(
            PolicyType::RateLimit,
            app,
            user,
            0,
            true,
            json!({"requests_per_minute": 500}),
        );
        let user_id = user_policy.id;

        let merged = merge_policies(vec![org_policy, user_policy]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, user_id);
    }

    #[test]
    fn test_priority_breaks_ties_within_level() {
        let low = policy(PolicyType::Budget, None, None, 1, true, json!({}));
        let high = policy(PolicyType::Budget, None, None, 9, true, json!({}));
        let high_id = high.id;
        let merged = merge_policies(vec![low, high]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, high_id);
    }

    #[test]
    fn test_equal_pair_keeps_first() {
        let first = policy(PolicyType::Budget, None, None, 5, true, json!({}));
        let second = policy(PolicyType::Budget, None, None, 5, true, json!({}));
        let first_id = first.id;
        let merged = merge_policies(vec![first, second]);
        assert_eq!(merged[0].id, first_id);
    }

    #[test]
    fn test_disabled_policies_dropped() {
        let merged = merge_policies(vec![policy(
            PolicyType::RateLimit,
            None,
            None,
            0,
            false,
            json!({}),
        )]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_no_duplicate_types_invariant() {
        let app = Some(Uuid::new_v4());
        let mut input = Vec::new();
        for priority in 0..5 {
            input.push(policy(PolicyType::RateLimit, None, None, priority, true, json!({})));
            input.push(policy(PolicyType::Routing, app, None, priority, true, json!({})));
        }
        let merged = merge_policies(input);
        let mut seen = std::collections::HashSet::new();
        for p in &merged {
            assert!(seen.insert(p.policy_type), "duplicate type in merge output");
        }
    }

    #[test]
    fn test_decode_typed_configs() {
        let merged = vec![
            policy(
                PolicyType::RateLimit,
                None,
                None,
                0,
                true,
                json!({"requests_per_minute": 100}),
            ),
            policy(
                PolicyType::Budget,
                None,
                None,
                0,
                true,
                json!({"max_daily_cost": "5.00"}),
            ),
            policy(
                PolicyType::Routing,
                None,
                None,
                0,
                true,
                json!({"primary_provider": "openai"}),
            ),
        ];
        let ids: Vec<_> = merged.iter().map(|p| p.id).collect();

        let result = decode_configs(&merged);
        assert!(result.allowed);
        assert!(result.violations.is_empty());
        assert_eq!(result.applied_policies, ids);
        assert_eq!(result.rate_limit.unwrap().requests_per_minute, 100);
        assert_eq!(
            result.budget.unwrap().max_daily_cost,
            rust_decimal::Decimal::new(500, 2)
        );
        assert_eq!(
            result.routing.unwrap().primary_provider.as_deref(),
            Some("openai")
        );
    }

    #[test]
    fn test_malformed_config_skipped_not_violated() {
        let merged = vec![policy(
            PolicyType::RateLimit,
            None,
            None,
            0,
            true,
            json!({"requests_per_minute": "not-a-number"}),
        )];
        let result = decode_configs(&merged);
        assert!(result.allowed);
        assert!(result.rate_limit.is_none());
        assert!(result.applied_policies.is_empty());
        assert!(result.violations.is_empty());
    }

    #[test]
    fn test_rag_and_pii_decode() {
        let merged = vec![
            policy(
                PolicyType::PiiDetection,
                None,
                None,
                0,
                true,
                json!({"block_on_detection": true}),
            ),
            policy(
                PolicyType::InjectionGuard,
                None,
                None,
                0,
                true,
                json!({"max_risk_score": 0.4}),
            ),
            policy(
                PolicyType::Rag,
                None,
                None,
                0,
                true,
                json!({"enabled": true, "collection": "docs", "top_k": 4}),
            ),
        ];
        let result = decode_configs(&merged);
        assert!(result.pii.unwrap().block_on_detection);
        assert!((result.injection.unwrap().max_risk_score - 0.4).abs() < f32::EPSILON);
        assert_eq!(result.rag.unwrap().collection.as_deref(), Some("docs"));
    }
}
