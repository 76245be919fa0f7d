//! Integration tests for provider routing and fallback, using the in-process
//! mock provider. Covers the fallback scenario: primary down, first healthy
//! fallback takes the request, and its pricing drives the cost.

use std::sync::Arc;

use rust_decimal::Decimal;
use std::str::FromStr;

use control_plane::models::inference::{ChatMessage, ChatRequest};
use control_plane::models::policy::RoutingConfig;
use control_plane::pipeline::cost;
use control_plane::providers::{MockProvider, Provider, ProviderRegistry, RoutingService};

fn chat_request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.into(),
        messages: vec![ChatMessage {
            role: "user".into(),
            content: "hello".into(),
        }],
        max_tokens: 32,
        temperature: None,
        top_p: None,
        stop: None,
    }
}

fn routing(primary: &str, fallbacks: &[&str]) -> RoutingConfig {
    RoutingConfig {
        primary_provider: Some(primary.into()),
        fallback_providers: fallbacks.iter().map(|s| s.to_string()).collect(),
        strategy: Default::default(),
    }
}

#[tokio::test]
async fn fallback_provider_serves_when_primary_is_down() {
    let openai = Arc::new(MockProvider::named("openai").unavailable());
    let anthropic = Arc::new(
        MockProvider::named("anthropic")
            .with_reply("served by the fallback")
            .with_usage(12, 8),
    );

    let registry = ProviderRegistry::new();
    registry.register(Arc::clone(&openai) as Arc<dyn Provider>);
    registry.register(Arc::clone(&anthropic) as Arc<dyn Provider>);
    let service = RoutingService::new(Arc::new(registry));

    let provider = service
        .provider_for_model("any-model", Some(&routing("openai", &["anthropic"])))
        .await
        .unwrap();
    assert_eq!(provider.name(), "anthropic");

    let response = provider.chat_completion(&chat_request("any-model")).await.unwrap();
    assert_eq!(response.choices[0].message.content, "served by the fallback");
    assert_eq!(
        response.usage.prompt_tokens + response.usage.completion_tokens,
        response.usage.total_tokens
    );

    // The unavailable primary was never invoked.
    assert_eq!(openai.call_count(), 0);
    assert_eq!(anthropic.call_count(), 1);
}

#[tokio::test]
async fn fallback_cost_uses_the_selected_providers_pricing() {
    let cheap_rate = Decimal::from_str("2").unwrap();
    let anthropic = Arc::new(
        MockProvider::named("anthropic")
            .with_pricing("shared-model", cheap_rate)
            .with_usage(1_000, 1_000),
    );
    let openai = Arc::new(
        MockProvider::named("openai")
            .with_pricing("shared-model", Decimal::from_str("10").unwrap())
            .unavailable(),
    );

    let registry = ProviderRegistry::new();
    registry.register(Arc::clone(&openai) as Arc<dyn Provider>);
    registry.register(Arc::clone(&anthropic) as Arc<dyn Provider>);
    let service = RoutingService::new(Arc::new(registry));

    let provider = service
        .provider_for_model("shared-model", Some(&routing("openai", &["anthropic"])))
        .await
        .unwrap();
    let response = provider.chat_completion(&chat_request("shared-model")).await.unwrap();

    let info = provider.model_info("shared-model").unwrap();
    let billed = cost::actual_cost(&response.usage, &info);
    // 1000 in at $2/M + 1000 out at $4/M.
    assert_eq!(billed, Decimal::from_str("0.006").unwrap());
}

#[tokio::test]
async fn denial_before_dispatch_never_touches_a_provider() {
    let provider = Arc::new(MockProvider::named("openai"));
    let registry = ProviderRegistry::new();
    registry.register(Arc::clone(&provider) as Arc<dyn Provider>);

    // A budget denial happens at stage 5; routing and dispatch never run.
    let config = control_plane::models::policy::BudgetConfig {
        max_daily_cost: Decimal::from_str("0.01").unwrap(),
        currency: "USD".into(),
        ..Default::default()
    };
    let decision = control_plane::limits::budget::decide(
        &config,
        Decimal::ZERO,
        Decimal::ZERO,
        Decimal::from_str("0.02").unwrap(),
    );
    assert!(!decision.allowed);
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn retryable_flag_survives_to_the_error_surface() {
    let provider = Arc::new(MockProvider::named("openai").failing_with("upstream 503", true));
    let registry = ProviderRegistry::new();
    registry.register(Arc::clone(&provider) as Arc<dyn Provider>);
    let service = RoutingService::new(Arc::new(registry));

    let selected = service.provider_for_model("gpt-4o", None).await.unwrap();
    let err = selected
        .chat_completion(&chat_request("gpt-4o"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let app: control_plane::errors::AppError = err.into();
    assert_eq!(app.code(), "provider_error");
}

#[tokio::test]
async fn price_floor_feeds_the_admission_estimate() {
    let registry = ProviderRegistry::new();
    registry.register(Arc::new(
        MockProvider::named("a").with_pricing("m", Decimal::from_str("8").unwrap()),
    ));
    registry.register(Arc::new(
        MockProvider::named("b").with_pricing("m", Decimal::from_str("3").unwrap()),
    ));

    let floor = registry.price_floor("m").unwrap();
    assert_eq!(floor, Decimal::from_str("3").unwrap());

    // (100 + 1000/2) tokens at the $3/M floor.
    let estimate = cost::estimate_cost(100, 1_000, floor);
    assert_eq!(estimate, Decimal::from_str("0.0018").unwrap());
}
