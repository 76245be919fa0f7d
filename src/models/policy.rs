use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A governance rule attached to an org, an app, or an (app, user) pair.
///
/// `config` stays opaque JSON here; the evaluator decodes it into the typed
/// shapes below and skips entries it cannot decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub org_id: Uuid,
    pub app_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub policy_type: PolicyType,
    pub config: serde_json::Value,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Scope level: user(3) > app(2) > org(1). Across levels the highest
    /// level defining a type wins wholesale; within a level, priority wins.
    pub fn scope_level(&self) -> u8 {
        if self.user_id.is_some() {
            3
        } else if self.app_id.is_some() {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    RateLimit,
    Budget,
    Routing,
    PiiDetection,
    InjectionGuard,
    Rag,
    Retry,
    Fallback,
    LoadBalance,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyType::RateLimit => "rate_limit",
            PolicyType::Budget => "budget",
            PolicyType::Routing => "routing",
            PolicyType::PiiDetection => "pii_detection",
            PolicyType::InjectionGuard => "injection_guard",
            PolicyType::Rag => "rag",
            PolicyType::Retry => "retry",
            PolicyType::Fallback => "fallback",
            PolicyType::LoadBalance => "load_balance",
        }
    }
}

impl std::str::FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limit" => Ok(PolicyType::RateLimit),
            "budget" => Ok(PolicyType::Budget),
            "routing" => Ok(PolicyType::Routing),
            "pii_detection" => Ok(PolicyType::PiiDetection),
            "injection_guard" => Ok(PolicyType::InjectionGuard),
            "rag" => Ok(PolicyType::Rag),
            "retry" => Ok(PolicyType::Retry),
            "fallback" => Ok(PolicyType::Fallback),
            "load_balance" => Ok(PolicyType::LoadBalance),
            other => Err(format!("unknown policy type '{}'", other)),
        }
    }
}

// ── Typed configs ─────────────────────────────────────────────

/// Per-window request and token ceilings. 0 = unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_minute: u64,
    #[serde(default)]
    pub requests_per_hour: u64,
    #[serde(default)]
    pub requests_per_day: u64,
    #[serde(default)]
    pub tokens_per_minute: u64,
    #[serde(default)]
    pub tokens_per_hour: u64,
    #[serde(default)]
    pub tokens_per_day: u64,
}

impl RateLimitConfig {
    pub fn is_unlimited(&self) -> bool {
        self.requests_per_minute == 0
            && self.requests_per_hour == 0
            && self.requests_per_day == 0
            && self.tokens_per_minute == 0
            && self.tokens_per_hour == 0
            && self.tokens_per_day == 0
    }
}

/// Spend ceilings in `currency`. 0 = unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub max_cost_per_request: Decimal,
    #[serde(default)]
    pub max_daily_cost: Decimal,
    #[serde(default)]
    pub max_monthly_cost: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".into()
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_per_request: Decimal::ZERO,
            max_daily_cost: Decimal::ZERO,
            max_monthly_cost: Decimal::ZERO,
            currency: default_currency(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub primary_provider: Option<String>,
    #[serde(default)]
    pub fallback_providers: Vec<String>,
    #[serde(default)]
    pub strategy: RoutingStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    LeastLatency,
    CostOptimized,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub block_on_detection: bool,
    #[serde(default)]
    pub redact: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionGuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub block_on_detection: bool,
    #[serde(default = "default_max_risk")]
    pub max_risk_score: f32,
}

fn default_true() -> bool {
    true
}

fn default_max_risk() -> f32 {
    0.7
}

/// RAG augmentation passthrough. Opaque to the pipeline beyond these knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub top_k: Option<u32>,
}
