use std::time::Duration;

use serde::Deserialize;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub idp: IdpConfig,
    pub providers: ProvidersConfig,
    pub observability: ObservabilityConfig,
    pub audit: AuditConfig,
    pub policy_cache: PolicyCacheConfig,
    pub rate_limit: RateLimitJobConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Per-request deadline inherited by every pipeline stage.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_secs: u64,
}

/// Identity-provider settings. The issuer and JWKS URLs follow the Cognito
/// layout: `https://cognito-idp.{region}.amazonaws.com/{pool_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct IdpConfig {
    pub region: String,
    pub pool_id: String,
    pub client_id: String,
    pub jwks_timeout_secs: u64,
    pub jwks_ttl_secs: u64,
}

impl IdpConfig {
    pub fn issuer(&self) -> String {
        format!(
            "https://cognito-idp.{}.amazonaws.com/{}",
            self.region, self.pool_id
        )
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.issuer())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub openai: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// `json` or `text`.
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub tracing_enabled: bool,
    pub tracing_endpoint: Option<String>,
    pub tracing_sample_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub buffer_size: usize,
    pub worker_count: usize,
    pub persist_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyCacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitJobConfig {
    pub cleanup_interval_secs: u64,
    pub retention_secs: u64,
}

impl RateLimitJobConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let providers = ProvidersConfig {
        openai: load_provider("OPENAI"),
        anthropic: load_provider("ANTHROPIC"),
    };

    if providers.openai.is_none() && providers.anthropic.is_none() {
        tracing::warn!("no provider credentials configured; every completion will fail routing");
    }

    Ok(Config {
        http: HttpConfig {
            host: env_or("CP_HTTP_HOST", "0.0.0.0"),
            port: env_parse("CP_HTTP_PORT", 8080),
            read_timeout_secs: env_parse("CP_HTTP_READ_TIMEOUT_SECS", 30),
            write_timeout_secs: env_parse("CP_HTTP_WRITE_TIMEOUT_SECS", 30),
            idle_timeout_secs: env_parse("CP_HTTP_IDLE_TIMEOUT_SECS", 120),
            shutdown_timeout_secs: env_parse("CP_HTTP_SHUTDOWN_TIMEOUT_SECS", 30),
            request_timeout_secs: env_parse("CP_REQUEST_TIMEOUT_SECS", 60),
        },
        database: DatabaseConfig {
            url: env_or("DATABASE_URL", "postgres://localhost/control_plane"),
            max_open_conns: env_parse("CP_DB_MAX_OPEN_CONNS", 25),
            max_idle_conns: env_parse("CP_DB_MAX_IDLE_CONNS", 5),
            conn_max_lifetime_secs: env_parse("CP_DB_CONN_MAX_LIFETIME_SECS", 1800),
        },
        idp: IdpConfig {
            region: env_or("CP_IDP_REGION", "us-east-1"),
            pool_id: env_or("CP_IDP_POOL_ID", ""),
            client_id: env_or("CP_IDP_CLIENT_ID", ""),
            jwks_timeout_secs: env_parse("CP_JWKS_TIMEOUT_SECS", 10),
            jwks_ttl_secs: env_parse("CP_JWKS_TTL_SECS", 3600),
        },
        providers,
        observability: ObservabilityConfig {
            log_level: env_or("CP_LOG_LEVEL", "info"),
            log_format: env_or("CP_LOG_FORMAT", "text"),
            metrics_enabled: env_parse("CP_METRICS_ENABLED", true),
            metrics_port: env_parse("CP_METRICS_PORT", 9090),
            tracing_enabled: env_parse("CP_TRACING_ENABLED", false),
            tracing_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            tracing_sample_rate: env_parse("CP_TRACING_SAMPLE_RATE", 1.0),
        },
        audit: AuditConfig {
            buffer_size: env_parse("CP_AUDIT_BUFFER_SIZE", 10_000),
            worker_count: env_parse("CP_AUDIT_WORKER_COUNT", 5),
            persist_timeout_secs: env_parse("CP_AUDIT_PERSIST_TIMEOUT_SECS", 5),
        },
        policy_cache: PolicyCacheConfig {
            max_entries: env_parse("CP_POLICY_CACHE_MAX_ENTRIES", 10_000),
            ttl_secs: env_parse("CP_POLICY_CACHE_TTL_SECS", 300),
            sweep_interval_secs: env_parse("CP_POLICY_CACHE_SWEEP_INTERVAL_SECS", 60),
        },
        rate_limit: RateLimitJobConfig {
            cleanup_interval_secs: env_parse("CP_RATE_LIMIT_CLEANUP_INTERVAL_SECS", 86_400),
            retention_secs: env_parse("CP_RATE_LIMIT_RETENTION_SECS", 7 * 86_400),
        },
    })
}

fn load_provider(prefix: &str) -> Option<ProviderConfig> {
    let api_key = std::env::var(format!("{}_API_KEY", prefix)).ok()?;
    if api_key.is_empty() {
        return None;
    }
    Some(ProviderConfig {
        api_key,
        base_url: std::env::var(format!("{}_BASE_URL", prefix)).ok(),
        timeout_secs: env_parse(&format!("{}_TIMEOUT_SECS", prefix), 60),
        max_retries: env_parse(&format!("{}_MAX_RETRIES", prefix), 2),
    })
}
