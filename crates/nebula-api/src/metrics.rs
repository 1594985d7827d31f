//! Prometheus metrics for the NebulaDB data API
//!
//! This module is only compiled when the `metrics` feature is enabled.
//!
//! Exposed metrics:
//! - `http_requests_total` - Counter for total HTTP requests
//! - `http_request_duration_seconds` - Histogram for request latencies
//! - `nebula_data_operations_total` - Counter for dispatched data operations
//! - `nebula_pool_entries` - Gauge for open tenant pool entries
//! - `nebula_usage_events_dropped_total` - Counter for usage events dropped under queue pressure

use crate::state::AppState;
use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    /// Counter for total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// Histogram for HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    /// Counter for data operations (list, get, create, update, delete, sql)
    pub static ref DATA_OPERATIONS_TOTAL: CounterVec = register_counter_vec!(
        "nebula_data_operations_total",
        "Total number of dispatched data operations",
        &["operation", "status"]
    )
    .unwrap();

    /// Gauge for open tenant pool entries
    pub static ref POOL_ENTRIES: Gauge = register_gauge!(
        "nebula_pool_entries",
        "Number of open tenant connection pool entries"
    )
    .unwrap();

    /// Counter for usage events dropped before reaching the sink
    pub static ref USAGE_EVENTS_DROPPED_TOTAL: Counter = register_counter!(
        "nebula_usage_events_dropped_total",
        "Total number of usage events dropped because the queue was full or closed"
    )
    .unwrap();
}

/// Axum middleware to track HTTP request metrics
pub async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(duration);

    response
}

/// Handler for the `/metrics` endpoint
///
/// Pool size is read at scrape time so the gauge follows every acquire and
/// release, not just readiness checks.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    set_pool_entries(state.pool.size().await);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub fn record_data_operation(operation: &str, status: u16) {
    DATA_OPERATIONS_TOTAL
        .with_label_values(&[operation, &status.to_string()])
        .inc();
}

pub fn set_pool_entries(count: usize) {
    POOL_ENTRIES.set(count as f64);
}

pub fn record_usage_dropped() {
    USAGE_EVENTS_DROPPED_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_move() {
        let before = USAGE_EVENTS_DROPPED_TOTAL.get();
        record_usage_dropped();
        assert!(USAGE_EVENTS_DROPPED_TOTAL.get() >= before + 1.0);

        record_data_operation("list", 200);
        assert!(
            DATA_OPERATIONS_TOTAL
                .with_label_values(&["list", "200"])
                .get()
                >= 1.0
        );

        set_pool_entries(3);
        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "nebula_pool_entries"));
    }
}
