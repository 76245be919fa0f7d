use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::metrics;
use crate::models::inference::ChatCompletionRequest;
use crate::scope::RequestScope;
use crate::AppState;

/// `POST /v1/chat/completions` — the pipeline's HTTP entry point.
#[tracing::instrument(skip(state, headers, body))]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let started = Instant::now();

    let token = extract_bearer_token(&headers)?;
    let claims = state.validator.validate(&token).await?;

    let request: ChatCompletionRequest = serde_json::from_slice(&body).map_err(|e| {
        AppError::Validation {
            reason: format!("malformed request body: {}", e),
            details: None,
        }
    })?;

    let client_ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let request_id = request
        .request_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let scope = RequestScope::new(request_id, claims, client_ip, user_agent);

    let result = state.pipeline.process_chat_completion(&scope, request).await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
    metrics::REQUEST_LATENCY
        .with_label_values(&[outcome])
        .observe(started.elapsed().as_secs_f64());

    result.map(Json)
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn export_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // The dropped-event gauge is sampled on scrape rather than pushed.
    let dropped = state.audit.dropped_count();
    let current = metrics::AUDIT_DROPPED.get();
    if dropped > current {
        metrics::AUDIT_DROPPED.inc_by(dropped - current);
    }
    metrics::render()
}

/// Bearer token from the Authorization header, falling back to the
/// same-named cookie. The header wins when both are present.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) {
            if !token.is_empty() {
                return Ok(token.trim().to_string());
            }
        }
    }

    if let Some(cookies) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            let pair = pair.trim();
            if let Some(token) = pair.strip_prefix("access_token=") {
                if !token.is_empty() {
                    return Ok(token.to_string());
                }
            }
        }
    }

    Err(AppError::Unauthorized(crate::auth::AuthError::InvalidToken(
        "missing bearer token".into(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_bearer_from_header() {
        let h = headers(&[("authorization", "Bearer abc.def.ghi")]);
        assert_eq!(extract_bearer_token(&h).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_bearer_from_cookie() {
        let h = headers(&[("cookie", "theme=dark; access_token=tok123; lang=en")]);
        assert_eq!(extract_bearer_token(&h).unwrap(), "tok123");
    }

    #[test]
    fn test_header_wins_over_cookie() {
        let h = headers(&[
            ("authorization", "Bearer header-token"),
            ("cookie", "access_token=cookie-token"),
        ]);
        assert_eq!(extract_bearer_token(&h).unwrap(), "header-token");
    }

    #[test]
    fn test_missing_token_unauthorized() {
        let h = headers(&[]);
        let err = extract_bearer_token(&h).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn test_non_bearer_scheme_rejected() {
        let h = headers(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert!(extract_bearer_token(&h).is_err());
    }
}
