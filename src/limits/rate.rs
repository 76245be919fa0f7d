//! Sliding-window rate limiting over an append-only Postgres event log.
//!
//! Request and token streams share the `rate_limit_events` table; the token
//! stream lives under the `<scope>:tokens` suffix and records one row with
//! `amount = tokens_used` per completed request.
//!
//! The window is advisory: two concurrent checks can both observe
//! `count = limit - 1` and both pass. Callers tolerate that burst.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tracing::debug;

use crate::errors::AppError;
use crate::models::policy::RateLimitConfig;

pub const TOKEN_STREAM_SUFFIX: &str = ":tokens";

/// Canonical check order: minute, hour, day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }

    pub fn length(&self) -> ChronoDuration {
        match self {
            Window::Minute => ChronoDuration::minutes(1),
            Window::Hour => ChronoDuration::hours(1),
            Window::Day => ChronoDuration::days(1),
        }
    }

    /// Next aligned boundary after `now`: top of the next minute/hour/day.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let truncated = match self {
            Window::Minute => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), now.minute(), 0)
                .single(),
            Window::Hour => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
                .single(),
            Window::Day => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single(),
        };
        truncated.map(|t| t + self.length()).unwrap_or(now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub violated_window: Option<Window>,
    pub reason: Option<String>,
    pub reset_at: Option<DateTime<Utc>>,
    /// Minimum headroom across the configured request windows.
    pub requests_remaining: Option<i64>,
}

impl RateLimitDecision {
    fn allow(remaining: Option<i64>) -> Self {
        Self {
            allowed: true,
            violated_window: None,
            reason: None,
            reset_at: None,
            requests_remaining: remaining,
        }
    }

    fn deny(window: Window, reason: String, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            violated_window: Some(window),
            reason: Some(reason),
            reset_at: Some(reset_at),
            requests_remaining: Some(0),
        }
    }
}

/// Observed sliding-window totals, fetched only for configured windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowCounts {
    pub requests: [i64; 3],
    pub tokens: [i64; 3],
}

impl RateLimitConfig {
    fn request_limit(&self, window: Window) -> u64 {
        match window {
            Window::Minute => self.requests_per_minute,
            Window::Hour => self.requests_per_hour,
            Window::Day => self.requests_per_day,
        }
    }

    fn token_limit(&self, window: Window) -> u64 {
        match window {
            Window::Minute => self.tokens_per_minute,
            Window::Hour => self.tokens_per_hour,
            Window::Day => self.tokens_per_day,
        }
    }
}

/// Pure decision over fetched counts. Requests are walked before tokens,
/// each in the canonical minute → hour → day order.
pub fn decide(config: &RateLimitConfig, counts: &WindowCounts, now: DateTime<Utc>) -> RateLimitDecision {
    let mut remaining: Option<i64> = None;

    for (i, window) in Window::ALL.iter().enumerate() {
        let limit = config.request_limit(*window);
        if limit == 0 {
            continue;
        }
        let count = counts.requests[i];
        if count >= limit as i64 {
            return RateLimitDecision::deny(
                *window,
                format!(
                    "request limit of {} per {} reached ({} in window)",
                    limit,
                    window.as_str(),
                    count
                ),
                window.next_reset(now),
            );
        }
        let headroom = limit as i64 - count;
        remaining = Some(remaining.map_or(headroom, |r| r.min(headroom)));
    }

    for (i, window) in Window::ALL.iter().enumerate() {
        let limit = config.token_limit(*window);
        if limit == 0 {
            continue;
        }
        let used = counts.tokens[i];
        if used >= limit as i64 {
            return RateLimitDecision::deny(
                *window,
                format!(
                    "token limit of {} per {} reached ({} in window)",
                    limit,
                    window.as_str(),
                    used
                ),
                window.next_reset(now),
            );
        }
    }

    RateLimitDecision::allow(remaining)
}

pub struct RateLimiter {
    pool: PgPool,
}

impl RateLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Sliding-window check against the event log. A missing or all-zero
    /// config short-circuits to allowed without touching the store.
    #[tracing::instrument(skip(self, config))]
    pub async fn check(
        &self,
        scope_key: &str,
        config: Option<&RateLimitConfig>,
    ) -> Result<RateLimitDecision, AppError> {
        let Some(config) = config else {
            return Ok(RateLimitDecision::allow(None));
        };
        if config.is_unlimited() {
            return Ok(RateLimitDecision::allow(None));
        }

        let now = Utc::now();
        let mut counts = WindowCounts::default();
        let token_scope = format!("{}{}", scope_key, TOKEN_STREAM_SUFFIX);

        for (i, window) in Window::ALL.iter().enumerate() {
            let since = now - window.length();
            if config.request_limit(*window) > 0 {
                counts.requests[i] = self.sum_events(scope_key, since, now).await?;
            }
            if config.token_limit(*window) > 0 {
                counts.tokens[i] = self.sum_events(&token_scope, since, now).await?;
            }
        }

        Ok(decide(config, &counts, now))
    }

    /// Append one request event and, when tokens were consumed, a single
    /// `amount = tokens_used` event on the token stream.
    pub async fn record(&self, scope_key: &str, tokens_used: u64) -> Result<(), AppError> {
        sqlx::query("INSERT INTO rate_limit_events (scope_key, amount) VALUES ($1, 1)")
            .bind(scope_key)
            .execute(&self.pool)
            .await?;

        if tokens_used > 0 {
            sqlx::query("INSERT INTO rate_limit_events (scope_key, amount) VALUES ($1, $2)")
                .bind(format!("{}{}", scope_key, TOKEN_STREAM_SUFFIX))
                .bind(tokens_used as i64)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Delete events older than the retention horizon. Returns rows removed.
    pub async fn cleanup(&self, older_than: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than)
                .unwrap_or_else(|_| ChronoDuration::days(7));
        let result = sqlx::query("DELETE FROM rate_limit_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        debug!(rows = result.rows_affected(), "rate-limit cleanup");
        Ok(result.rows_affected())
    }

    async fn sum_events(
        &self,
        scope_key: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM rate_limit_events \
             WHERE scope_key = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(scope_key)
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpm: u64, rph: u64, rpd: u64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: rpm,
            requests_per_hour: rph,
            requests_per_day: rpd,
            ..Default::default()
        }
    }

    #[test]
    fn test_unlimited_config_allows() {
        let decision = decide(&RateLimitConfig::default(), &WindowCounts::default(), Utc::now());
        assert!(decision.allowed);
        assert!(decision.requests_remaining.is_none());
    }

    #[test]
    fn test_under_limit_allows_with_remaining() {
        let counts = WindowCounts {
            requests: [40, 0, 0],
            tokens: [0; 3],
        };
        let decision = decide(&config(100, 0, 0), &counts, Utc::now());
        assert!(decision.allowed);
        assert_eq!(decision.requests_remaining, Some(60));
    }

    #[test]
    fn test_exactly_at_limit_denied() {
        let counts = WindowCounts {
            requests: [100, 0, 0],
            tokens: [0; 3],
        };
        let decision = decide(&config(100, 0, 0), &counts, Utc::now());
        assert!(!decision.allowed);
        assert_eq!(decision.violated_window, Some(Window::Minute));
        assert_eq!(decision.requests_remaining, Some(0));
        assert!(decision.reset_at.unwrap() > Utc::now() - ChronoDuration::seconds(1));
    }

    #[test]
    fn test_one_below_limit_allowed() {
        let counts = WindowCounts {
            requests: [99, 0, 0],
            tokens: [0; 3],
        };
        let decision = decide(&config(100, 0, 0), &counts, Utc::now());
        assert!(decision.allowed);
        assert_eq!(decision.requests_remaining, Some(1));
    }

    #[test]
    fn test_remaining_is_min_over_windows() {
        let counts = WindowCounts {
            requests: [5, 950, 0],
            tokens: [0; 3],
        };
        let decision = decide(&config(100, 1000, 0), &counts, Utc::now());
        assert!(decision.allowed);
        assert_eq!(decision.requests_remaining, Some(50));
    }

    #[test]
    fn test_window_check_order_minute_first() {
        // Both minute and hour violated: the minute window must be reported.
        let counts = WindowCounts {
            requests: [100, 1000, 0],
            tokens: [0; 3],
        };
        let decision = decide(&config(100, 1000, 0), &counts, Utc::now());
        assert_eq!(decision.violated_window, Some(Window::Minute));
    }

    #[test]
    fn test_token_window_denial() {
        let cfg = RateLimitConfig {
            requests_per_minute: 100,
            tokens_per_hour: 10_000,
            ..Default::default()
        };
        let counts = WindowCounts {
            requests: [1, 0, 0],
            tokens: [0, 10_000, 0],
        };
        let decision = decide(&cfg, &counts, Utc::now());
        assert!(!decision.allowed);
        assert_eq!(decision.violated_window, Some(Window::Hour));
        assert!(decision.reason.unwrap().contains("token limit"));
    }

    #[test]
    fn test_requests_checked_before_tokens() {
        let cfg = RateLimitConfig {
            requests_per_day: 10,
            tokens_per_minute: 100,
            ..Default::default()
        };
        let counts = WindowCounts {
            requests: [0, 0, 10],
            tokens: [100, 0, 0],
        };
        let decision = decide(&cfg, &counts, Utc::now());
        assert_eq!(decision.violated_window, Some(Window::Day));
        assert!(decision.reason.unwrap().contains("request limit"));
    }

    #[test]
    fn test_next_reset_alignment() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 14, 25, 42).unwrap();
        assert_eq!(
            Window::Minute.next_reset(now),
            Utc.with_ymd_and_hms(2025, 3, 10, 14, 26, 0).unwrap()
        );
        assert_eq!(
            Window::Hour.next_reset(now),
            Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
        );
        assert_eq!(
            Window::Day.next_reset(now),
            Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_reset_is_within_window_length() {
        let now = Utc::now();
        for window in Window::ALL {
            let reset = window.next_reset(now);
            assert!(reset > now);
            assert!(reset - now <= window.length());
        }
    }
}
