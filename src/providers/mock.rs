//! In-process provider double for routing and pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::inference::{ChatMessage, ChatRequest, ChatResponse, Choice, Usage};

use super::{ModelInfo, Provider, ProviderError};

pub struct MockProvider {
    name: String,
    available: AtomicBool,
    calls: AtomicU32,
    pricing: HashMap<String, Decimal>,
    canned_reply: String,
    usage: Usage,
    failure: Mutex<Option<(String, bool)>>,
}

impl MockProvider {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            pricing: HashMap::new(),
            canned_reply: "mock completion".into(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            failure: Mutex::new(None),
        }
    }

    pub fn with_pricing(mut self, model: &str, input_cost_per_m: Decimal) -> Self {
        self.pricing.insert(model.to_string(), input_cost_per_m);
        self
    }

    pub fn with_reply(mut self, reply: &str) -> Self {
        self.canned_reply = reply.to_string();
        self
    }

    pub fn with_usage(mut self, prompt: u32, completion: u32) -> Self {
        self.usage = Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        };
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    pub fn failing_with(self, message: &str, retryable: bool) -> Self {
        *self.failure.lock().unwrap() = Some((message.to_string(), retryable));
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// How many times `chat_completion` ran. Lets tests assert that denied
    /// requests never reached the provider.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((message, retryable)) = self.failure.lock().unwrap().clone() {
            return Err(if retryable {
                ProviderError::Retryable(message)
            } else {
                ProviderError::Fatal(message)
            });
        }
        Ok(ChatResponse {
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".into(),
                    content: self.canned_reply.clone(),
                },
                finish_reason: "stop".into(),
            }],
            usage: self.usage.clone(),
        })
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        if self.pricing.is_empty() {
            // A mock without explicit pricing serves every model at a flat rate.
            return Some(ModelInfo {
                input_cost_per_m: Decimal::ONE,
                output_cost_per_m: Decimal::ONE,
                context_limit: 128_000,
            });
        }
        self.pricing.get(model).map(|input| ModelInfo {
            input_cost_per_m: *input,
            output_cost_per_m: *input * Decimal::from(2),
            context_limit: 128_000,
        })
    }
}
