//! Period-scoped budget accounting.
//!
//! One upserted row per `(scope_key, period_key)` carries the running total;
//! the `budget_transactions` log records every commit for reconciliation.
//! The pre-check is advisory like the rate limiter; the commit is atomic via
//! `ON CONFLICT .. DO UPDATE SET total_cost = total_cost + EXCLUDED.total_cost`
//! so concurrent increments never lose money.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::policy::BudgetConfig;
use crate::store::tx::with_transaction;

/// UTC calendar bucket keys: (`YYYY-MM-DD`, `YYYY-MM`).
pub fn period_keys(now: DateTime<Utc>) -> (String, String) {
    (
        now.format("%Y-%m-%d").to_string(),
        now.format("%Y-%m").to_string(),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub violated_period: Option<String>,
    pub reason: Option<String>,
    pub daily_spend: Decimal,
    pub daily_limit: Decimal,
    pub monthly_spend: Decimal,
    pub monthly_limit: Decimal,
}

impl BudgetDecision {
    fn allow(daily: Decimal, monthly: Decimal, config: &BudgetConfig) -> Self {
        Self {
            allowed: true,
            violated_period: None,
            reason: None,
            daily_spend: daily,
            daily_limit: config.max_daily_cost,
            monthly_spend: monthly,
            monthly_limit: config.max_monthly_cost,
        }
    }

    pub fn details(&self) -> serde_json::Value {
        serde_json::json!({
            "daily_spend": self.daily_spend.to_string(),
            "daily_limit": self.daily_limit.to_string(),
            "monthly_spend": self.monthly_spend.to_string(),
            "monthly_limit": self.monthly_limit.to_string(),
        })
    }
}

/// Pure decision over fetched totals. Exactly reaching a limit is allowed;
/// the first unit past it is denied.
pub fn decide(
    config: &BudgetConfig,
    daily_total: Decimal,
    monthly_total: Decimal,
    cost: Decimal,
) -> BudgetDecision {
    let mut decision = BudgetDecision::allow(daily_total, monthly_total, config);

    if config.max_cost_per_request > Decimal::ZERO && cost > config.max_cost_per_request {
        decision.allowed = false;
        decision.violated_period = Some("per_request".into());
        decision.reason = Some(format!(
            "estimated cost {} exceeds the per-request cap of {} {}",
            cost, config.max_cost_per_request, config.currency
        ));
        return decision;
    }

    if config.max_daily_cost > Decimal::ZERO && daily_total + cost > config.max_daily_cost {
        decision.allowed = false;
        decision.violated_period = Some("daily".into());
        decision.reason = Some(format!(
            "daily budget of {} {} exceeded ({} spent, {} requested)",
            config.max_daily_cost, config.currency, daily_total, cost
        ));
        return decision;
    }

    if config.max_monthly_cost > Decimal::ZERO && monthly_total + cost > config.max_monthly_cost {
        decision.allowed = false;
        decision.violated_period = Some("monthly".into());
        decision.reason = Some(format!(
            "monthly budget of {} {} exceeded ({} spent, {} requested)",
            config.max_monthly_cost, config.currency, monthly_total, cost
        ));
        return decision;
    }

    decision
}

#[derive(Debug, Clone, Serialize)]
pub struct SpendSummary {
    pub scope_key: String,
    pub daily_spend: Decimal,
    pub monthly_spend: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TopSpender {
    pub scope_key: String,
    pub total_cost: Decimal,
}

pub struct BudgetEngine {
    pool: PgPool,
}

impl BudgetEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Advisory pre-check against the running period totals.
    #[tracing::instrument(skip(self, config, estimated_cost))]
    pub async fn check(
        &self,
        scope_key: &str,
        config: Option<&BudgetConfig>,
        estimated_cost: Decimal,
    ) -> Result<BudgetDecision, AppError> {
        let Some(config) = config else {
            return Ok(decide(&BudgetConfig::default(), Decimal::ZERO, Decimal::ZERO, estimated_cost));
        };

        let (daily_key, monthly_key) = period_keys(Utc::now());
        let daily = if config.max_daily_cost > Decimal::ZERO {
            self.counter_total(scope_key, &daily_key).await?
        } else {
            Decimal::ZERO
        };
        let monthly = if config.max_monthly_cost > Decimal::ZERO {
            self.counter_total(scope_key, &monthly_key).await?
        } else {
            Decimal::ZERO
        };

        Ok(decide(config, daily, monthly, estimated_cost))
    }

    /// Commit actual cost: both period upserts and the transaction-log insert
    /// run inside one transaction, ordered daily → monthly → log.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_cost(
        &self,
        scope_key: &str,
        cost: Decimal,
        currency: &str,
        provider: &str,
        model: &str,
        request_id: &str,
        tokens_used: u32,
    ) -> Result<(), AppError> {
        if cost <= Decimal::ZERO {
            return Ok(());
        }

        let (daily_key, monthly_key) = period_keys(Utc::now());
        // Owned copies so the transaction closure borrows nothing but `tx`.
        let scope_key = scope_key.to_string();
        let currency = currency.to_string();
        let provider = provider.to_string();
        let model = model.to_string();
        let request_id = request_id.to_string();

        with_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                upsert_counter(tx, &scope_key, &daily_key, cost, &currency).await?;
                upsert_counter(tx, &scope_key, &monthly_key, cost, &currency).await?;

                sqlx::query(
                    "INSERT INTO budget_transactions \
                     (id, scope_key, cost, currency, provider, model, request_id, tokens_used) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(Uuid::new_v4())
                .bind(&scope_key)
                .bind(cost)
                .bind(&currency)
                .bind(&provider)
                .bind(&model)
                .bind(&request_id)
                .bind(tokens_used as i32)
                .execute(&mut **tx)
                .await?;

                Ok(())
            })
        })
        .await
    }

    pub async fn spend_summary(&self, scope_key: &str) -> Result<SpendSummary, AppError> {
        let (daily_key, monthly_key) = period_keys(Utc::now());
        Ok(SpendSummary {
            scope_key: scope_key.to_string(),
            daily_spend: self.counter_total(scope_key, &daily_key).await?,
            monthly_spend: self.counter_total(scope_key, &monthly_key).await?,
            currency: "USD".into(),
        })
    }

    /// Highest-spending scopes under an organization for a period.
    pub async fn top_spenders(
        &self,
        org_id: Uuid,
        period_key: &str,
        limit: i64,
    ) -> Result<Vec<TopSpender>, AppError> {
        let rows = sqlx::query_as::<_, TopSpender>(
            "SELECT scope_key, total_cost FROM budget_counters \
             WHERE scope_key LIKE $1 AND period_key = $2 \
             ORDER BY total_cost DESC LIMIT $3",
        )
        .bind(format!("org:{}%", org_id))
        .bind(period_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Drop daily counters and transactions past the retention horizon.
    /// Monthly counters are kept; they are the billing record of truth.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than)
                .unwrap_or_else(|_| ChronoDuration::days(90));
        let cutoff_day = cutoff.format("%Y-%m-%d").to_string();

        let counters = sqlx::query(
            // Daily keys are exactly 10 chars (YYYY-MM-DD); monthly keys are 7.
            "DELETE FROM budget_counters WHERE length(period_key) = 10 AND period_key < $1",
        )
        .bind(&cutoff_day)
        .execute(&self.pool)
        .await?;

        let transactions =
            sqlx::query("DELETE FROM budget_transactions WHERE created_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        let removed = counters.rows_affected() + transactions.rows_affected();
        debug!(rows = removed, "budget cleanup");
        Ok(removed)
    }

    async fn counter_total(&self, scope_key: &str, period_key: &str) -> Result<Decimal, AppError> {
        let total: Option<Decimal> = sqlx::query_scalar(
            "SELECT total_cost FROM budget_counters WHERE scope_key = $1 AND period_key = $2",
        )
        .bind(scope_key)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }
}

async fn upsert_counter(
    tx: &mut Transaction<'static, Postgres>,
    scope_key: &str,
    period_key: &str,
    cost: Decimal,
    currency: &str,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO budget_counters (scope_key, period_key, total_cost, currency, updated_at) \
         VALUES ($1, $2, $3, $4, now()) \
         ON CONFLICT (scope_key, period_key) DO UPDATE \
         SET total_cost = budget_counters.total_cost + EXCLUDED.total_cost, updated_at = now()",
    )
    .bind(scope_key)
    .bind(period_key)
    .bind(cost)
    .bind(currency)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
