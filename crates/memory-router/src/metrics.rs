//! Prometheus metrics for the memory store, the reaper, and the router

use prometheus::{Encoder, TextEncoder, Registry, IntCounterVec, IntCounter, Histogram};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use axum::response::IntoResponse;
use axum::http::StatusCode;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static EXPIRED_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static EVICTED_COUNTER: OnceLock<IntCounter> = OnceLock::new();
static ROUTE_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static CONTEXT_DEGRADED: OnceLock<IntCounterVec> = OnceLock::new();
static SWEEP_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Create and register every collector. Safe to call more than once.
pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .expect("valid metric definition")
    });

    let expired = EXPIRED_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("entries_expired_total", "Entries removed by the TTL sweep"),
            &["entity"],
        )
        .expect("valid metric definition")
    });

    let evicted = EVICTED_COUNTER.get_or_init(|| {
        IntCounter::new("entries_evicted_total", "System entries removed under capacity pressure")
            .expect("valid metric definition")
    });

    let routes = ROUTE_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("routes_total", "Routing decisions per selected class"),
            &["class"],
        )
        .expect("valid metric definition")
    });

    let degraded = CONTEXT_DEGRADED.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!(
                "context_degraded_total",
                "Routes classified without conversation context"
            ),
            &["reason"],
        )
        .expect("valid metric definition")
    });

    let sweep_duration = SWEEP_DURATION.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "sweep_duration_seconds",
            "Wall time of one expiry sweep",
        ))
        .expect("valid metric definition")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(expired.clone())).ok();
    REGISTRY.register(Box::new(evicted.clone())).ok();
    REGISTRY.register(Box::new(routes.clone())).ok();
    REGISTRY.register(Box::new(degraded.clone())).ok();
    REGISTRY.register(Box::new(sweep_duration.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_expired(entity: &str, count: usize) {
    if let Some(counter) = EXPIRED_COUNTER.get() {
        counter.with_label_values(&[entity]).inc_by(count as u64);
    }
}

pub fn inc_evicted(count: usize) {
    if let Some(counter) = EVICTED_COUNTER.get() {
        counter.inc_by(count as u64);
    }
}

pub fn inc_route(class: &str) {
    if let Some(counter) = ROUTE_COUNTER.get() {
        counter.with_label_values(&[class]).inc();
    }
}

pub fn inc_context_degraded(reason: &str) {
    if let Some(counter) = CONTEXT_DEGRADED.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn observe_sweep(duration: f64) {
    if let Some(histogram) = SWEEP_DURATION.get() {
        histogram.observe(duration);
    }
}

pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

pub async fn get_metrics() -> impl IntoResponse {
    match render() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; version=0.0.4")],
                Vec::new(),
            )
        }
    }
}
