//! Prometheus counters for the request path. Exposed on the metrics port
//! when `metrics_enabled` is set.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        opts!("inference_requests_total", "Inference requests by outcome"),
        &["outcome"],
    )
    .expect("metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration");
    counter
});

pub static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        histogram_opts!(
            "inference_request_duration_seconds",
            "End-to-end request latency"
        ),
        &["outcome"],
    )
    .expect("metric definition");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("metric registration");
    histogram
});

pub static AUDIT_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "audit_events_dropped_total",
        "Audit events dropped on a full queue",
    )
    .expect("metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration");
    counter
});

pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}
