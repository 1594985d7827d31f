//! HTTP routes.
//!
//! All `/api/v1` routes require an API key and pass through the rate limiter.
//! Health and metrics endpoints are served without either.

use crate::api_keys::{identity_middleware, IdentityState, Principal};
use crate::error::ApiError;
use crate::health::{health_check, liveness_check, readiness_check};
use crate::rate_limiting::rate_limit_middleware;
use crate::request_id::request_id_middleware;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use nebuladb_core::{DatabaseStatus, LogicalDatabase, NebulaError, TableSchema, UsagePeriod};
use nebuladb_storage::AccessControl;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/v1/databases/:database_id/data/:table",
            get(list_records).post(create_record),
        )
        .route(
            "/api/v1/databases/:database_id/data/:table/:id",
            get(get_record).put(update_record).delete(delete_record),
        )
        .route(
            "/api/v1/databases/:database_id/tables",
            get(list_tables).post(create_table),
        )
        .route(
            "/api/v1/databases/:database_id/tables/:name",
            get(get_table).delete(delete_table),
        )
        .route("/api/v1/databases/:database_id/sql", post(execute_sql))
        .route("/api/v1/databases/:database_id/status", put(set_database_status))
        .route("/api/v1/projects/:project_id/usage", get(project_usage))
        // Identity runs first so the limiter can key by principal.
        .layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            IdentityState {
                keys: state.api_keys.clone(),
                attempts: state.auth_attempts.clone(),
            },
            identity_middleware,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/live", get(liveness_check))
        .route("/ready", get(readiness_check));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(crate::metrics::metrics_handler));

    let app = app.merge(api).with_state(state).layer(CorsLayer::permissive());

    #[cfg(feature = "metrics")]
    let app = app.layer(middleware::from_fn(crate::metrics::track_metrics));

    app.layer(middleware::from_fn(request_id_middleware))
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(format!("Invalid request body: {}", rejection.body_text())))
}

// =============================================================================
// Generated data API
// =============================================================================

async fn list_records(
    State(state): State<AppState>,
    principal: Principal,
    Path((database_id, table)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let page = state
        .dispatcher
        .list(&principal, &database_id, &table, &params)
        .await?;
    Ok(Json(page))
}

async fn get_record(
    State(state): State<AppState>,
    principal: Principal,
    Path((database_id, table, id)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .dispatcher
        .get(&principal, &database_id, &table, &id)
        .await?;
    Ok(Json(json!({ "data": record })))
}

async fn create_record(
    State(state): State<AppState>,
    principal: Principal,
    Path((database_id, table)): Path<(String, String)>,
    payload: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let body = json_body(payload)?;
    let record = state
        .dispatcher
        .create(&principal, &database_id, &table, &body)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": record }))))
}

async fn update_record(
    State(state): State<AppState>,
    principal: Principal,
    Path((database_id, table, id)): Path<(String, String, String)>,
    payload: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let body = json_body(payload)?;
    let record = state
        .dispatcher
        .update(&principal, &database_id, &table, &id, &body)
        .await?;
    Ok(Json(json!({ "data": record })))
}

async fn delete_record(
    State(state): State<AppState>,
    principal: Principal,
    Path((database_id, table, id)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state
        .dispatcher
        .delete(&principal, &database_id, &table, &id)
        .await?;
    Ok(Json(json!({
        "message": "Record deleted successfully",
        "deleted": deleted,
    })))
}

// =============================================================================
// Table management
// =============================================================================

/// Authorize and require ownership of the database's project.
async fn authorize_owner(state: &AppState, principal: &Principal, database_id: &str) -> ApiResult<LogicalDatabase> {
    let database = state.dispatcher.authorize(principal, database_id).await?;
    if !state
        .metadata
        .is_owner(&principal.user_id, &database.project_id)
        .await?
    {
        return Err(NebulaError::AccessDenied(
            "Only the project owner can perform this operation".to_string(),
        )
        .into());
    }
    Ok(database)
}

async fn list_tables(
    State(state): State<AppState>,
    principal: Principal,
    Path(database_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.dispatcher.authorize(&principal, &database_id).await?;
    let tables = state.metadata.list_tables(&database_id).await?;
    Ok(Json(json!({ "count": tables.len(), "tables": tables })))
}

async fn get_table(
    State(state): State<AppState>,
    principal: Principal,
    Path((database_id, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.dispatcher.authorize(&principal, &database_id).await?;
    let table = state
        .metadata
        .get_table(&database_id, &name)
        .await?
        .ok_or_else(|| NebulaError::NotFound("Table not found".to_string()))?;
    Ok(Json(json!({ "data": table })))
}

/// Register the schema, then create the physical table. A failed create
/// removes the registration again.
async fn create_table(
    State(state): State<AppState>,
    principal: Principal,
    Path(database_id): Path<String>,
    payload: std::result::Result<Json<TableSchema>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let schema = json_body(payload)?;
    authorize_owner(&state, &principal, &database_id).await?;

    let stored = state.metadata.register_table(&database_id, &schema).await?;

    let created = async {
        let store = state.pool.acquire(&database_id).await?;
        store.create_table(&stored.schema).await
    }
    .await;

    if let Err(e) = created {
        if let Err(cleanup) = state.metadata.delete_table(&database_id, &stored.schema.name).await {
            warn!(
                database_id = %database_id,
                table = %stored.schema.name,
                error = %cleanup,
                "Failed to remove table registration after create failure"
            );
        }
        return Err(e.into());
    }

    info!(database_id = %database_id, table = %stored.schema.name, "Created table");
    Ok((StatusCode::CREATED, Json(json!({ "data": stored }))))
}

async fn delete_table(
    State(state): State<AppState>,
    principal: Principal,
    Path((database_id, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    authorize_owner(&state, &principal, &database_id).await?;
    if state.metadata.get_table(&database_id, &name).await?.is_none() {
        return Err(NebulaError::NotFound("Table not found".to_string()).into());
    }

    let store = state.pool.acquire(&database_id).await?;
    store.drop_table(&name).await?;
    state.metadata.delete_table(&database_id, &name).await?;

    info!(database_id = %database_id, table = %name, "Deleted table");
    Ok(Json(json!({ "message": "Table deleted successfully" })))
}

// =============================================================================
// SQL, lifecycle, usage
// =============================================================================

#[derive(Debug, Deserialize)]
struct SqlRequest {
    query: String,
}

async fn execute_sql(
    State(state): State<AppState>,
    principal: Principal,
    Path(database_id): Path<String>,
    payload: std::result::Result<Json<SqlRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = json_body(payload)?;
    let response = state
        .dispatcher
        .execute_sql(&principal, &database_id, &request.query)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: String,
}

async fn set_database_status(
    State(state): State<AppState>,
    principal: Principal,
    Path(database_id): Path<String>,
    payload: std::result::Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = json_body(payload)?;
    let status: DatabaseStatus = request.status.parse()?;
    authorize_owner(&state, &principal, &database_id).await?;

    let database = state.lifecycle.set_status(&database_id, status).await?;
    info!(database_id = %database_id, status = %status, "Database status changed");
    Ok(Json(json!({ "data": database })))
}

async fn project_usage(
    State(state): State<AppState>,
    principal: Principal,
    Path(project_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let period = match params.get("period") {
        Some(raw) => raw.parse::<UsagePeriod>()?,
        None => UsagePeriod::default(),
    };
    if !state.metadata.is_owner(&principal.user_id, &project_id).await? {
        return Err(NebulaError::AccessDenied("Access denied".to_string()).into());
    }
    let summary = state.metadata.usage_summary(&project_id, period).await?;
    Ok(Json(summary))
}
