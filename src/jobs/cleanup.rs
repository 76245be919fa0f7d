//! Periodic maintenance tasks, spawned once at startup. None of them are
//! load-bearing for correctness: the rate limiter re-counts live windows,
//! the policy cache expires entries in-line, and budget history only grows.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::time;
use tracing::error;

use crate::config::{PolicyCacheConfig, RateLimitJobConfig};
use crate::limits::{BudgetEngine, RateLimiter};
use crate::policy::PolicyCache;

/// Rate-limit event retention. Runs on the configured cadence (daily by
/// default) with a retention wider than the largest window.
pub fn spawn_rate_limit_cleanup(pool: PgPool, config: RateLimitJobConfig) {
    tokio::spawn(async move {
        let limiter = RateLimiter::new(pool);
        let mut interval = time::interval(Duration::from_secs(config.cleanup_interval_secs));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match limiter.cleanup(config.retention()).await {
                Ok(rows) if rows > 0 => {
                    tracing::info!(rows, "expired rate-limit events removed")
                }
                Ok(_) => {}
                Err(e) => error!("rate-limit cleanup failed: {}", e),
            }
        }
    });
}

/// Budget counter/transaction retention. Daily counters and transaction
/// rows older than ninety days go; monthly counters stay.
pub fn spawn_budget_cleanup(pool: PgPool) {
    const INTERVAL: Duration = Duration::from_secs(86_400);
    const RETENTION: Duration = Duration::from_secs(90 * 86_400);

    tokio::spawn(async move {
        let budget = BudgetEngine::new(pool);
        let mut interval = time::interval(INTERVAL);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match budget.cleanup(RETENTION).await {
                Ok(rows) if rows > 0 => tracing::info!(rows, "expired budget rows removed"),
                Ok(_) => {}
                Err(e) => error!("budget cleanup failed: {}", e),
            }
        }
    });
}

/// Policy cache sweeper. `get` already drops expired entries in-line; this
/// just keeps memory tidy for keys that stop being requested.
pub fn spawn_policy_cache_sweeper(cache: Arc<PolicyCache>, config: PolicyCacheConfig) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(config.sweep_interval_secs));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = cache.cleanup_expired();
            if removed > 0 {
                tracing::debug!(removed, "policy cache sweep");
            }
        }
    });
}
