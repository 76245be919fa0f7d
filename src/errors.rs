use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {reason}")]
    Validation {
        reason: String,
        details: Option<serde_json::Value>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded on {window} window")]
    RateLimit {
        window: String,
        reason: String,
        reset_at: chrono::DateTime<chrono::Utc>,
        remaining: i64,
    },

    #[error("budget exceeded for {period} period")]
    Budget {
        period: String,
        reason: String,
        details: serde_json::Value,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("policy violation: {reason}")]
    PolicyViolation {
        reason: String,
        details: Option<serde_json::Value>,
    },

    #[error("provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("no provider available for model {0}")]
    ProviderUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(reason: impl Into<String>) -> Self {
        AppError::Validation {
            reason: reason.into(),
            details: None,
        }
    }

    /// Machine-readable error code used in the JSON body and audit details.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Validation { .. } => "validation_error",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::RateLimit { .. } => "rate_limit_exceeded",
            AppError::Budget { .. } => "budget_exceeded",
            AppError::Conflict(_) => "conflict",
            AppError::PolicyViolation { .. } => "policy_violation",
            AppError::Provider { .. } | AppError::ProviderUnavailable(_) => "provider_error",
            AppError::Database(_) | AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message, details) = match &self {
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, what.clone(), None),
            AppError::Validation { reason, details } => {
                (StatusCode::BAD_REQUEST, reason.clone(), details.clone())
            }
            AppError::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e.to_string(), None),
            AppError::Forbidden(reason) => (StatusCode::FORBIDDEN, reason.clone(), None),
            AppError::RateLimit {
                window,
                reason,
                reset_at,
                ..
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                reason.clone(),
                Some(json!({ "window": window, "reset_at": reset_at.to_rfc3339() })),
            ),
            AppError::Budget {
                period,
                reason,
                details,
            } => {
                let mut d = details.clone();
                if let Some(obj) = d.as_object_mut() {
                    obj.insert("period".into(), json!(period));
                }
                (StatusCode::PAYMENT_REQUIRED, reason.clone(), Some(d))
            }
            AppError::Conflict(reason) => (StatusCode::CONFLICT, reason.clone(), None),
            AppError::PolicyViolation { reason, details } => {
                (StatusCode::FORBIDDEN, reason.clone(), details.clone())
            }
            AppError::Provider { message, retryable } => (
                StatusCode::BAD_GATEWAY,
                message.clone(),
                Some(json!({ "retryable": retryable })),
            ),
            AppError::ProviderUnavailable(model) => (
                StatusCode::BAD_GATEWAY,
                format!("no provider available for model '{}'", model),
                Some(json!({ "retryable": false })),
            ),
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                    None,
                )
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                    None,
                )
            }
        };

        let mut body = json!({ "error": code, "message": message });
        if let Some(d) = details {
            body["details"] = d;
        }

        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimit {
            reset_at, remaining, ..
        } = &self
        {
            let headers = response.headers_mut();
            // Decimal string, never a raw byte conversion.
            if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert("x-ratelimit-remaining", v);
            }
            let secs = (*reset_at - chrono::Utc::now()).num_seconds().max(0);
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                headers.insert("retry-after", v);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::NotFound("org".into()).code(), "not_found");
        assert_eq!(AppError::validation("bad").code(), "validation_error");
        assert_eq!(AppError::Conflict("dup".into()).code(), "conflict");
        assert_eq!(
            AppError::Provider {
                message: "boom".into(),
                retryable: true
            }
            .code(),
            "provider_error"
        );
        assert_eq!(
            AppError::ProviderUnavailable("gpt-4".into()).code(),
            "provider_error"
        );
    }

    #[test]
    fn test_rate_limit_response_headers() {
        let err = AppError::RateLimit {
            window: "minute".into(),
            reason: "request limit reached".into(),
            reset_at: chrono::Utc::now() + chrono::Duration::seconds(30),
            remaining: 0,
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get("x-ratelimit-remaining").unwrap(),
            &HeaderValue::from_static("0")
        );
        let retry: i64 = resp
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((0..=30).contains(&retry));
    }

    #[test]
    fn test_budget_response_carries_period() {
        let err = AppError::Budget {
            period: "daily".into(),
            reason: "daily budget of $0.01 exceeded".into(),
            details: json!({ "daily_spend": "0.02", "daily_limit": "0.01" }),
        };
        assert_eq!(err.code(), "budget_exceeded");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_internal_error_hides_cause() {
        let err = AppError::Internal(anyhow::anyhow!("connection pool poisoned at 0x1234"));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
