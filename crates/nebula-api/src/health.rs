//! Health Check Module
//!
//! Provides Kubernetes-compatible health endpoints:
//! - `/health` - Basic health check (returns "ok")
//! - `/ready` - Readiness probe (metadata store connectivity, pool and usage queue state)
//! - `/live` - Liveness probe (always returns healthy if the process is running)

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use nebuladb_storage::PoolStats;
use serde::Serialize;

use crate::state::AppState;
use crate::usage::UsageStats;

/// Health check response with detailed status
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_store: Option<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_queue: Option<UsageStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health status enumeration
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but the usage queue is saturated
    Degraded,
    Unhealthy,
}

/// Component health status
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Basic health check - always returns "ok" if the server is running
pub async fn health_check() -> &'static str {
    "ok"
}

/// Liveness probe - indicates if the application is running
pub async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: HealthStatus::Healthy,
            metadata_store: None,
            pool: None,
            usage_queue: None,
            message: Some("Service is alive".to_string()),
        }),
    )
}

/// Readiness probe - indicates if the application is ready to serve traffic
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let start = std::time::Instant::now();

    let metadata_health = match state.metadata.ping().await {
        Ok(()) => ComponentHealth {
            status: HealthStatus::Healthy,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            message: None,
        },
        Err(e) => ComponentHealth {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(format!("Metadata store query failed: {}", e)),
        },
    };

    let pool = state.pool.stats().await;

    let usage = state.usage.stats();
    let overall_status = match metadata_health.status {
        HealthStatus::Unhealthy => HealthStatus::Unhealthy,
        _ if usage.pending as usize >= usage.capacity => HealthStatus::Degraded,
        status => status,
    };

    let status_code = match overall_status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let response = HealthResponse {
        status: overall_status,
        metadata_store: Some(metadata_health),
        pool: Some(pool),
        usage_queue: Some(usage),
        message: if overall_status == HealthStatus::Unhealthy {
            Some("Service is not ready".to_string())
        } else {
            Some("Service is ready".to_string())
        },
    };

    tracing::debug!(
        status = ?overall_status,
        latency_ms = start.elapsed().as_millis(),
        "Readiness check completed"
    );

    (status_code, Json(response))
}
