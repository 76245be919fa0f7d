use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use control_plane::{api, cli, config, jobs, AppState};
use control_plane::limits::{BudgetEngine, RateLimiter};
use control_plane::store::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(&cfg)?;

    let args = cli::Cli::parse();
    match args.command {
        Some(cli::Commands::Cleanup) => run_cleanup(cfg).await,
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        None => run_server(cfg, None).await,
    }
}

fn init_tracing(cfg: &config::Config) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| format!("control_plane={},tower_http=info", cfg.observability.log_level)),
    );

    let fmt_layer = if cfg.observability.log_format == "json" {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let telemetry_layer = if cfg.observability.tracing_enabled
        && cfg.observability.tracing_endpoint.is_some()
    {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(
                sdktrace::config()
                    .with_sampler(sdktrace::Sampler::TraceIdRatioBased(
                        cfg.observability.tracing_sample_rate,
                    ))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        "control-plane",
                    )])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .init();

    Ok(())
}

async fn run_server(cfg: config::Config, port_override: Option<u16>) -> anyhow::Result<()> {
    let host = cfg.http.host.clone();
    let port = port_override.unwrap_or(cfg.http.port);
    let shutdown_timeout = Duration::from_secs(cfg.http.shutdown_timeout_secs);

    tracing::info!("connecting to database");
    let state = AppState::build(cfg).await?;

    tracing::info!("running migrations");
    state.store.migrate().await?;

    jobs::cleanup::spawn_rate_limit_cleanup(
        state.store.pool().clone(),
        state.config.rate_limit.clone(),
    );
    jobs::cleanup::spawn_budget_cleanup(state.store.pool().clone());
    jobs::cleanup::spawn_policy_cache_sweeper(
        std::sync::Arc::clone(&state.policy_cache),
        state.config.policy_cache.clone(),
    );

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, api::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining audit sink");
    if let Err(e) = state.audit.stop(shutdown_timeout).await {
        tracing::warn!("audit sink drain incomplete: {}", e);
    }

    Ok(())
}

async fn run_cleanup(cfg: config::Config) -> anyhow::Result<()> {
    let store = PgStore::connect(&cfg.database).await?;

    let limiter = RateLimiter::new(store.pool().clone());
    let removed = limiter.cleanup(cfg.rate_limit.retention()).await?;
    println!("rate-limit events removed: {}", removed);

    let budget = BudgetEngine::new(store.pool().clone());
    let removed = budget.cleanup(Duration::from_secs(90 * 86_400)).await?;
    println!("budget rows removed: {}", removed);

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
