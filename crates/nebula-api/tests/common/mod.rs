//! Shared fixtures for API integration tests.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use nebuladb_api::api_keys::ApiKeyConfig;
use nebuladb_api::rate_limiting::RateLimitConfig;
use nebuladb_api::usage::UsageWorkerHandle;
use nebuladb_api::{router, ApiConfig, AppState};
use nebuladb_core::{ColumnDef, ColumnType, DatabaseStatus, TableSchema};
use nebuladb_storage::NewDatabase;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub const DATABASE_ID: &str = "db-acme";

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub project_id: String,
    pub owner_key: String,
    pub member_key: String,
    pub stranger_key: String,
    pub usage_worker: UsageWorkerHandle,
    _temp_dir: TempDir,
}

pub fn column(name: &str, column_type: ColumnType, required: bool, unique: bool) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        column_type,
        required,
        unique,
    }
}

pub fn users_schema() -> TableSchema {
    TableSchema {
        name: "users".to_string(),
        columns: vec![
            column("name", ColumnType::Text, true, false),
            column("email", ColumnType::Text, false, true),
        ],
        indexes: vec![],
        api_enabled: true,
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with_rate_limit(1000).await
    }

    /// Seeded app: project `acme` owned by alice, bob as member, an active
    /// database with a `users` table, and one API key per principal.
    pub async fn with_rate_limit(limit: u32) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = ApiConfig {
            metadata_db: temp_dir.path().join("meta.db"),
            tenant_storage_template: format!(
                "{}/tenants/{{database_id}}.db",
                temp_dir.path().display()
            ),
            rate_limit: RateLimitConfig {
                limit,
                ..Default::default()
            },
            api_keys: ApiKeyConfig {
                bcrypt_cost: 4,
                ..Default::default()
            },
            ..Default::default()
        };

        let (state, usage_worker) = AppState::build(&config).unwrap();

        let project = state.metadata.create_project("acme", "alice").await.unwrap();
        state
            .metadata
            .add_member(&project.id, "bob", "member")
            .await
            .unwrap();
        state
            .metadata
            .create_database(NewDatabase {
                id: Some(DATABASE_ID.to_string()),
                project_id: project.id.clone(),
                name: "main".to_string(),
                connection_descriptor: None,
                status: DatabaseStatus::Active,
            })
            .await
            .unwrap();

        let schema = users_schema();
        state
            .metadata
            .register_table(DATABASE_ID, &schema)
            .await
            .unwrap();
        state
            .pool
            .acquire(DATABASE_ID)
            .await
            .unwrap()
            .create_table(&schema)
            .await
            .unwrap();

        let owner_key = state.api_keys.create_key("owner", "alice").await.unwrap();
        let member_key = state.api_keys.create_key("member", "bob").await.unwrap();
        let stranger_key = state
            .api_keys
            .create_key("stranger", "mallory")
            .await
            .unwrap();

        Self {
            app: router(state.clone()),
            state,
            project_id: project.id,
            owner_key,
            member_key,
            stranger_key,
            usage_worker,
            _temp_dir: temp_dir,
        }
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        key: Option<&str>,
    ) -> (StatusCode, Value) {
        let (status, _, body) = self.request_full(method, path, body, key).await;
        (status, body)
    }

    pub async fn request_full(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        key: Option<&str>,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {}", key));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));
        (status, headers, value)
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self._temp_dir.path()
    }

    /// Shorthand for an owner call.
    pub async fn owner(&self, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let key = self.owner_key.clone();
        self.request(method, path, body, Some(&key)).await
    }
}

pub fn data_path(table: &str) -> String {
    format!("/api/v1/databases/{}/data/{}", DATABASE_ID, table)
}
