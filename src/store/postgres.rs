//! Postgres persistence for tenants, policies, inference requests and audit
//! rows. Rate-limit and budget tables are owned by their engines in
//! `limits::`; this store covers everything else.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::errors::AppError;
use crate::models::audit::AuditLog;
use crate::models::inference::{InferenceRequest, RequestStatus, Usage};
use crate::models::policy::{Policy, PolicyType};
use crate::models::tenant::{Application, Organization, User, UserRole};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns.min(config.max_open_conns))
            .max_lifetime(Duration::from_secs(config.conn_max_lifetime_secs))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ── Organizations ─────────────────────────────────────────

    pub async fn create_organization(&self, name: &str, slug: &str) -> Result<Organization, AppError> {
        sqlx::query_as::<_, Organization>(
            "INSERT INTO organizations (name, slug) VALUES ($1, $2) \
             RETURNING id, name, slug, created_at",
        )
        .bind(name)
        .bind(slug)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, "organization slug already in use"))
    }

    pub async fn get_organization(&self, id: Uuid) -> Result<Option<Organization>, AppError> {
        let row = sqlx::query_as::<_, Organization>(
            "SELECT id, name, slug, created_at FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ── Applications ──────────────────────────────────────────

    pub async fn create_application(
        &self,
        org_id: Uuid,
        name: &str,
        api_key_hash: &str,
    ) -> Result<Application, AppError> {
        sqlx::query_as::<_, Application>(
            "INSERT INTO applications (org_id, name, api_key_hash) VALUES ($1, $2, $3) \
             RETURNING id, org_id, name, api_key_hash, created_at",
        )
        .bind(org_id)
        .bind(name)
        .bind(api_key_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, "application api key already registered"))
    }

    pub async fn get_application_by_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Option<Application>, AppError> {
        let row = sqlx::query_as::<_, Application>(
            "SELECT id, org_id, name, api_key_hash, created_at FROM applications \
             WHERE api_key_hash = $1",
        )
        .bind(api_key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ── Users ─────────────────────────────────────────────────

    pub async fn upsert_user(
        &self,
        org_id: Uuid,
        email: &str,
        external_subject: &str,
        role: UserRole,
    ) -> Result<User, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (org_id, email, external_subject, role) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (external_subject) DO UPDATE SET email = EXCLUDED.email \
             RETURNING id, org_id, email, external_subject, role, created_at",
        )
        .bind(org_id)
        .bind(email)
        .bind(external_subject)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    pub async fn get_user_by_subject(&self, external_subject: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, org_id, email, external_subject, role, created_at FROM users \
             WHERE external_subject = $1",
        )
        .bind(external_subject)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    // ── Policies ──────────────────────────────────────────────

    /// Enabled policies visible to `(org, app, user?)`: org-wide rows, rows
    /// scoped to the app, and (when a user is given) rows scoped to the user.
    pub async fn policies_for_scope(
        &self,
        org_id: Uuid,
        app_id: Uuid,
        user_id: Option<Uuid>,
    ) -> Result<Vec<Policy>, AppError> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT id, org_id, app_id, user_id, policy_type, config, priority, enabled, \
                    created_at, updated_at \
             FROM policies \
             WHERE enabled = true AND org_id = $1 AND ( \
                   (app_id IS NULL AND user_id IS NULL) \
                OR (app_id = $2 AND user_id IS NULL) \
                OR ($3::uuid IS NOT NULL AND user_id = $3) \
             )",
        )
        .bind(org_id)
        .bind(app_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(PolicyRow::into_policy_lossy)
            .collect())
    }

    pub async fn create_policy(&self, policy: &Policy) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO policies \
             (id, org_id, app_id, user_id, policy_type, config, priority, enabled) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(policy.id)
        .bind(policy.org_id)
        .bind(policy.app_id)
        .bind(policy.user_id)
        .bind(policy.policy_type.as_str())
        .bind(&policy.config)
        .bind(policy.priority)
        .bind(policy.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_policy(&self, policy: &Policy) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE policies SET config = $2, priority = $3, enabled = $4, updated_at = now() \
             WHERE id = $1",
        )
        .bind(policy.id)
        .bind(&policy.config)
        .bind(policy.priority)
        .bind(policy.enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_policy(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM policies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Inference requests ────────────────────────────────────

    pub async fn insert_inference(&self, request: &InferenceRequest) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO inference_requests \
             (id, request_id, org_id, app_id, user_id, provider, model, messages, parameters, \
              status, client_ip, user_agent, applied_policies) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(request.id)
        .bind(&request.request_id)
        .bind(request.org_id)
        .bind(request.app_id)
        .bind(request.user_id)
        .bind(&request.provider)
        .bind(&request.model)
        .bind(&request.messages)
        .bind(&request.parameters)
        .bind(request.status.as_str())
        .bind(&request.client_ip)
        .bind(&request.user_agent)
        .bind(&request.applied_policies)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "request_id already processed"))?;
        Ok(())
    }

    /// pending → processing, stamping the selected provider and the policies
    /// the evaluator applied.
    pub async fn mark_processing(
        &self,
        id: Uuid,
        provider: &str,
        applied_policies: &[Uuid],
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE inference_requests \
             SET status = 'processing', provider = $2, applied_policies = $3 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(provider)
        .bind(applied_policies)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(inference_id = %id, "processing transition skipped: not pending");
        }
        Ok(())
    }

    /// processing → completed with the final usage and cost figures.
    pub async fn mark_completed(
        &self,
        id: Uuid,
        usage: &Usage,
        cost: rust_decimal::Decimal,
        latency_ms: i64,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE inference_requests \
             SET status = 'completed', prompt_tokens = $2, completion_tokens = $3, \
                 total_tokens = $4, cost = $5, latency_ms = $6, completed_at = now() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(usage.prompt_tokens as i32)
        .bind(usage.completion_tokens as i32)
        .bind(usage.total_tokens as i32)
        .bind(cost)
        .bind(latency_ms)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(inference_id = %id, "completed transition skipped: not processing");
        }
        Ok(())
    }

    /// pending → rejected carrying the denial detail.
    pub async fn mark_rejected(
        &self,
        id: Uuid,
        violations: &serde_json::Value,
        error: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE inference_requests \
             SET status = 'rejected', violations = $2, error = $3, completed_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(violations)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(inference_id = %id, "rejected transition skipped: not pending");
        }
        Ok(())
    }

    /// pending | processing → failed.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE inference_requests \
             SET status = 'failed', error = $2, completed_at = now() \
             WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(inference_id = %id, "failed transition skipped: already terminal");
        }
        Ok(())
    }

    pub async fn get_inference_status(&self, id: Uuid) -> Result<Option<RequestStatus>, AppError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM inference_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.and_then(|s| RequestStatus::from_str(&s).ok()))
    }
}

/// The audit sink's persistence seam. `PgStore` is the production writer;
/// tests swap in an in-memory one.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn persist_audit(&self, entry: &AuditLog) -> anyhow::Result<()>;
}

#[async_trait]
impl AuditWriter for PgStore {
    async fn persist_audit(&self, entry: &AuditLog) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs \
             (id, org_id, app_id, user_id, action, resource_type, resource_id, details, \
              request_id, client_ip, user_agent, model, provider, tokens_used, cost, \
              latency_ms, status_code, error_message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19)",
        )
        .bind(entry.id)
        .bind(entry.org_id)
        .bind(entry.app_id)
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.details)
        .bind(&entry.request_id)
        .bind(&entry.client_ip)
        .bind(&entry.user_agent)
        .bind(&entry.model)
        .bind(&entry.provider)
        .bind(entry.tokens_used)
        .bind(entry.cost)
        .bind(entry.latency_ms)
        .bind(entry.status_code)
        .bind(&entry.error_message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── Row conversions ───────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    org_id: Uuid,
    email: String,
    external_subject: String,
    role: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role = UserRole::from_str(&row.role)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        Ok(User {
            id: row.id,
            org_id: row.org_id,
            email: row.email,
            external_subject: row.external_subject,
            role,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    org_id: Uuid,
    app_id: Option<Uuid>,
    user_id: Option<Uuid>,
    policy_type: String,
    config: serde_json::Value,
    priority: i32,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PolicyRow {
    /// Rows with a policy type this build does not know are dropped with a
    /// warning rather than failing the whole fetch.
    fn into_policy_lossy(self) -> Option<Policy> {
        match PolicyType::from_str(&self.policy_type) {
            Ok(policy_type) => Some(Policy {
                id: self.id,
                org_id: self.org_id,
                app_id: self.app_id,
                user_id: self.user_id,
                policy_type,
                config: self.config,
                priority: self.priority,
                enabled: self.enabled,
                created_at: self.created_at,
                updated_at: self.updated_at,
            }),
            Err(e) => {
                warn!(policy_id = %self.id, "{}", e);
                None
            }
        }
    }
}

fn map_unique(e: sqlx::Error, message: &str) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return AppError::Conflict(message.to_string());
        }
    }
    AppError::Database(e)
}
