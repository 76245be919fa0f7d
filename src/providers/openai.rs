//! OpenAI chat-completions adapter.

use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::models::inference::{ChatMessage, ChatRequest, ChatResponse, Choice, Usage};

use super::{ModelInfo, Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    client: ClientWithMiddleware,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        let retry_policy =
            ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key.clone(),
            client,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    index: u32,
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("malformed openai response: {}", e)))?;
        debug!(model = %parsed.model, "openai completion");

        Ok(ChatResponse {
            model: parsed.model,
            choices: parsed
                .choices
                .into_iter()
                .map(|c| Choice {
                    index: c.index,
                    message: c.message,
                    finish_reason: c.finish_reason.unwrap_or_else(|| "stop".into()),
                })
                .collect(),
            usage: Usage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
            },
        })
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self.client.get(&url).bearer_auth(&self.api_key).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        let d = |s: &str| Decimal::from_str(s).unwrap();
        // More-specific patterns come first: `contains` would otherwise let
        // gpt-4o swallow gpt-4o-mini.
        let (input, output, context) = match model {
            m if m.contains("gpt-4o-mini") => ("0.15", "0.60", 128_000),
            m if m.contains("gpt-4o") => ("2.50", "10.00", 128_000),
            m if m.contains("o3-mini") => ("1.10", "4.40", 200_000),
            m if m.contains("o3") => ("10.00", "40.00", 200_000),
            m if m.contains("o1-mini") => ("3.00", "12.00", 128_000),
            m if m.contains("o1") => ("15.00", "60.00", 200_000),
            m if m.contains("gpt-4-turbo") => ("10.00", "30.00", 128_000),
            m if m.contains("gpt-4") => ("30.00", "60.00", 8_192),
            m if m.contains("gpt-3.5-turbo") => ("0.50", "1.50", 16_385),
            _ => return None,
        };
        Some(ModelInfo {
            input_cost_per_m: d(input),
            output_cost_per_m: d(output),
            context_limit: context,
        })
    }
}

fn transport_error(e: reqwest_middleware::Error) -> ProviderError {
    match &e {
        reqwest_middleware::Error::Reqwest(inner)
            if inner.is_timeout() || inner.is_connect() =>
        {
            ProviderError::Retryable(format!("openai transport error: {}", e))
        }
        _ => ProviderError::Fatal(format!("openai request failed: {}", e)),
    }
}

fn classify_status(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| format!("HTTP {}", status));

    match status {
        429 | 408 | 500..=599 => {
            ProviderError::Retryable(format!("openai: {}", message))
        }
        _ => ProviderError::Fatal(format!("openai: {}", message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new(&ProviderConfig {
            api_key: "sk-test".into(),
            base_url: Some(server.uri()),
            timeout_secs: 5,
            max_retries: 0,
        })
    }

    fn chat_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "hello".into(),
            }],
            max_tokens: 64,
            temperature: None,
            top_p: None,
            stop: None,
        }
    }

    #[tokio::test]
    async fn test_chat_completion_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-2024-08-06",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "hi there" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 8, "completion_tokens": 3, "total_tokens": 11 }
            })))
            .mount(&server)
            .await;

        let response = provider_for(&server)
            .chat_completion(&chat_request())
            .await
            .unwrap();
        assert_eq!(response.choices[0].message.content, "hi there");
        assert_eq!(response.usage.total_tokens, 11);
        assert_eq!(
            response.usage.prompt_tokens + response.usage.completion_tokens,
            response.usage.total_tokens
        );
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": { "message": "Rate limit exceeded", "type": "rate_limit_error" }
            })))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .chat_completion(&chat_request())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn test_bad_request_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "Invalid model" }
            })))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .chat_completion(&chat_request())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .chat_completion(&chat_request())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_is_available() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;
        assert!(provider_for(&server).is_available().await);
    }

    #[test]
    fn test_model_pricing_specific_before_general() {
        let server_less = ProviderConfig {
            api_key: "sk-test".into(),
            base_url: None,
            timeout_secs: 5,
            max_retries: 0,
        };
        let provider = OpenAiProvider::new(&server_less);

        let mini = provider.model_info("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(mini.input_cost_per_m, Decimal::from_str("0.15").unwrap());

        let full = provider.model_info("gpt-4o-2024-08-06").unwrap();
        assert_eq!(full.input_cost_per_m, Decimal::from_str("2.50").unwrap());

        let o3_mini = provider.model_info("o3-mini-2025-01-31").unwrap();
        assert_eq!(o3_mini.input_cost_per_m, Decimal::from_str("1.10").unwrap());

        assert!(provider.model_info("claude-3-5-sonnet").is_none());
    }
}
