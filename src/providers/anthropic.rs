//! Anthropic Messages API adapter.
//!
//! `x-api-key` auth, `anthropic-version` header, system prompt hoisted to a
//! top-level field, `stop_sequences` instead of `stop`.

use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::models::inference::{ChatMessage, ChatRequest, ChatResponse, Choice, Usage};

use super::{ModelInfo, Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: ClientWithMiddleware,
}

impl AnthropicProvider {
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

    /// The Messages API takes the system prompt as a top-level field, not as
    /// a message.
    fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
        let mut system_parts = Vec::new();
        let mut rest = Vec::new();
        for message in messages {
            if message.role == "system" {
                system_parts.push(message.content.as_str());
            } else {
                rest.push(message);
            }
        }
        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, rest)
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<&'a ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let (system, messages) = Self::split_system(&request.messages);
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            messages,
            system,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.as_ref(),
        };

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("malformed anthropic response: {}", e)))?;
        debug!(model = %parsed.model, "anthropic completion");

        let text = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = match parsed.stop_reason.as_deref() {
            Some("end_turn") | None => "stop".to_string(),
            Some("max_tokens") => "length".to_string(),
            Some(other) => other.to_string(),
        };

        Ok(ChatResponse {
            model: parsed.model,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".into(),
                    content: text,
                },
                finish_reason,
            }],
            usage: Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
        })
    }

    async fn is_available(&self) -> bool {
        // No cheap unauthenticated health endpoint; a HEAD against the API
        // root answering at all is the liveness signal.
        let url = format!("{}/v1/messages", self.base_url);
        self.client.head(&url).send().await.is_ok()
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        let d = |s: &str| Decimal::from_str(s).unwrap();
        let (input, output, context) = match model {
            m if m.contains("claude-3-5-haiku") => ("0.80", "4.00", 200_000),
            m if m.contains("claude-3-5-sonnet") => ("3.00", "15.00", 200_000),
            m if m.contains("claude-3-7-sonnet") => ("3.00", "15.00", 200_000),
            m if m.contains("claude-3-opus") => ("15.00", "75.00", 200_000),
            m if m.contains("claude-3-haiku") => ("0.25", "1.25", 200_000),
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
            ProviderError::Retryable(format!("anthropic transport error: {}", e))
        }
        _ => ProviderError::Fatal(format!("anthropic request failed: {}", e)),
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
        // 529 ("overloaded") sits inside the 5xx range.
        429 | 408 | 500..=599 => ProviderError::Retryable(format!("anthropic: {}", message)),
        _ => ProviderError::Fatal(format!("anthropic: {}", message)),
    }
}
