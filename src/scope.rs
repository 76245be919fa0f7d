use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::ParsedClaims;

/// Per-request context threaded through every pipeline stage by reference.
/// Tenant identity comes from the verified claims; there is no module-global
/// for per-request data.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub request_id: String,
    pub org_id: Uuid,
    pub app_id: Uuid,
    pub user_id: Option<Uuid>,
    pub claims: ParsedClaims,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl RequestScope {
    pub fn new(
        request_id: String,
        claims: ParsedClaims,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        // Tokens without an app claim act as the org-wide application: tenant
        // scoping falls back to the org id so rate and budget buckets still
        // have a stable key.
        let app_id = claims.app_id.unwrap_or(claims.org_id);
        Self {
            request_id,
            org_id: claims.org_id,
            app_id,
            user_id: Some(claims.subject),
            claims,
            client_ip,
            user_agent,
            received_at: Utc::now(),
        }
    }

    /// Dotted bucket key for rate-limit and budget counters:
    /// `org:{org}:app:{app}[:user:{user}]`.
    pub fn scope_key(&self) -> String {
        match self.user_id {
            Some(user) => format!(
                "org:{}:app:{}:user:{}",
                self.org_id, self.app_id, user
            ),
            None => format!("org:{}:app:{}", self.org_id, self.app_id),
        }
    }

    /// App-level bucket key, ignoring the user segment. Used when a policy is
    /// scoped to the app rather than an individual caller.
    pub fn app_scope_key(&self) -> String {
        format!("org:{}:app:{}", self.org_id, self.app_id)
    }
}
