use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scope::RequestScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    InferenceRequest,
    PolicyViolation,
    PolicyCreated,
    PolicyUpdated,
    PolicyDeleted,
    UserCreated,
    UserUpdated,
    AppCreated,
    AppUpdated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::InferenceRequest => "inference_request",
            AuditAction::PolicyViolation => "policy_violation",
            AuditAction::PolicyCreated => "policy_created",
            AuditAction::PolicyUpdated => "policy_updated",
            AuditAction::PolicyDeleted => "policy_deleted",
            AuditAction::UserCreated => "user_created",
            AuditAction::UserUpdated => "user_updated",
            AuditAction::AppCreated => "app_created",
            AuditAction::AppUpdated => "app_updated",
        }
    }
}

/// Append-only audit record. There is no update path anywhere in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub org_id: Uuid,
    pub app_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
    pub request_id: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tokens_used: Option<i32>,
    pub cost: Option<Decimal>,
    pub latency_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    /// Base record scoped to the current request's tenant identity.
    pub fn for_scope(scope: &RequestScope, action: AuditAction, resource_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: scope.org_id,
            app_id: Some(scope.app_id),
            user_id: scope.user_id,
            action,
            resource_type: resource_type.to_string(),
            resource_id: None,
            details: serde_json::json!({}),
            request_id: scope.request_id.clone(),
            client_ip: scope.client_ip.clone(),
            user_agent: scope.user_agent.clone(),
            model: None,
            provider: None,
            tokens_used: None,
            cost: None,
            latency_ms: None,
            status_code: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, status_code: i32) -> Self {
        self.error_message = Some(message.into());
        self.status_code = Some(status_code);
        self
    }
}
