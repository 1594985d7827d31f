//! Table management, direct SQL, lifecycle, and usage endpoints.

mod common;

use axum::http::StatusCode;
use common::{data_path, TestApp, DATABASE_ID};
use nebuladb_core::{DatabaseStatus, UsagePeriod};
use nebuladb_storage::NewDatabase;
use serde_json::json;
use std::time::Duration;

fn tables_path() -> String {
    format!("/api/v1/databases/{}/tables", DATABASE_ID)
}

fn sql_path() -> String {
    format!("/api/v1/databases/{}/sql", DATABASE_ID)
}

fn orders_schema() -> serde_json::Value {
    json!({
        "name": "orders",
        "columns": [
            {"name": "total", "type": "float", "required": true},
            {"name": "paid", "type": "boolean"}
        ]
    })
}

#[tokio::test]
async fn test_owner_creates_and_drops_table() {
    let app = TestApp::spawn().await;

    let (status, body) = app.owner("POST", &tables_path(), Some(orders_schema())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["name"], "orders");

    let (status, body) = app
        .owner("POST", &data_path("orders"), Some(json!({"total": 9.5, "paid": true})))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["total"], 9.5);
    assert_eq!(body["data"]["paid"], true);

    let (status, body) = app.owner("GET", &tables_path(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (status, body) = app
        .owner("GET", &format!("{}/orders", tables_path()), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["columns"][0]["name"], "total");

    let (status, _) = app
        .owner("DELETE", &format!("{}/orders", tables_path()), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.owner("GET", &data_path("orders"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app
        .owner("DELETE", &format!("{}/orders", tables_path()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_table_management_requires_owner() {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .request("POST", &tables_path(), Some(orders_schema()), Some(&app.member_key))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Members may still read table definitions.
    let (status, body) = app
        .request("GET", &tables_path(), None, Some(&app.member_key))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, _) = app
        .request(
            "DELETE",
            &format!("{}/users", tables_path()),
            None,
            Some(&app.member_key),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_duplicate_and_invalid_tables_rejected() {
    let app = TestApp::spawn().await;

    let mut duplicate = orders_schema();
    duplicate["name"] = json!("users");
    let (status, _) = app.owner("POST", &tables_path(), Some(duplicate)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let mut reserved = orders_schema();
    reserved["name"] = json!("sqlite_master");
    let (status, _) = app.owner("POST", &tables_path(), Some(reserved)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .owner("POST", &tables_path(), Some(json!({"columns": "nope"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
}

#[tokio::test]
async fn test_sql_execution() {
    let app = TestApp::spawn().await;
    for name in ["alice", "bob"] {
        app.owner("POST", &data_path("users"), Some(json!({"name": name})))
            .await;
    }

    let (status, body) = app
        .owner(
            "POST",
            &sql_path(),
            Some(json!({"query": "SELECT name FROM users ORDER BY name"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["columns"], json!(["name"]));
    assert_eq!(body["rows"], json!([["alice"], ["bob"]]));
    assert_eq!(body["row_count"], 2);
    assert!(body["duration_ms"].is_u64());
    assert!(body.get("message").is_none());

    let (status, body) = app
        .owner(
            "POST",
            &sql_path(),
            Some(json!({"query": "UPDATE users SET email = 'x@example.com' WHERE name = 'bob'"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "UPDATE 1");
}

#[tokio::test]
async fn test_sql_guard() {
    let app = TestApp::spawn().await;

    for query in [
        "DROP DATABASE main",
        "truncate users",
        "GRANT ALL ON users TO mallory",
        "PRAGMA journal_mode = DELETE",
        "ATTACH 'x.db' AS o",
        "VACUUM INTO '/tmp/nebula-copy.db'",
        "SELECT fingerprint FROM _nebula_credentials",
        "",
    ] {
        let (status, _) = app
            .owner("POST", &sql_path(), Some(json!({ "query": query })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "query {:?}", query);
    }

    let (status, _) = app
        .request(
            "POST",
            &sql_path(),
            Some(json!({"query": "SELECT 1"})),
            Some(&app.stranger_key),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Keywords inside data or names are not operations.
    app.owner("POST", &data_path("users"), Some(json!({"name": "Grant"})))
        .await;
    for query in [
        "SELECT name FROM users WHERE name = 'Grant'",
        "CREATE TABLE grants (who TEXT)",
    ] {
        let (status, _) = app
            .owner("POST", &sql_path(), Some(json!({ "query": query })))
            .await;
        assert_eq!(status, StatusCode::OK, "query {:?}", query);
    }
}

#[tokio::test]
async fn test_sql_cannot_read_another_tenant() {
    let app = TestApp::spawn().await;

    let other = app
        .state
        .metadata
        .create_project("vault", "mallory")
        .await
        .unwrap();
    app.state
        .metadata
        .create_database(NewDatabase {
            id: Some("db-secret".to_string()),
            project_id: other.id,
            name: "secret".to_string(),
            connection_descriptor: None,
            status: DatabaseStatus::Active,
        })
        .await
        .unwrap();
    let store = app.state.pool.acquire("db-secret").await.unwrap();
    store
        .execute_sql("CREATE TABLE secrets (v TEXT)")
        .await
        .unwrap();
    store
        .execute_sql("INSERT INTO secrets VALUES ('mallory-password')")
        .await
        .unwrap();

    let secret_path = "/api/v1/databases/db-secret/sql";
    let (status, _) = app
        .owner("POST", secret_path, Some(json!({"query": "SELECT v FROM secrets"})))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let secret_file = app.temp_path().join("tenants/db-secret.db");
    assert!(secret_file.exists());
    let attach = format!("ATTACH '{}' AS o", secret_file.display());
    let (status, _) = app
        .owner("POST", &sql_path(), Some(json!({ "query": attach })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A later request on a reused connection sees nothing attached.
    let (status, body) = app
        .owner("POST", &sql_path(), Some(json!({"query": "SELECT v FROM o.secrets"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.to_string().contains("mallory-password"));

    let copy = app.temp_path().join("exfil.db");
    let vacuum = format!("VACUUM INTO '{}'", copy.display());
    let (status, _) = app
        .owner("POST", &sql_path(), Some(json!({ "query": vacuum })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!copy.exists());
}

#[tokio::test]
async fn test_suspended_database_is_unavailable() {
    let app = TestApp::spawn().await;
    let status_path = format!("/api/v1/databases/{}/status", DATABASE_ID);

    let (status, _) = app
        .request(
            "PUT",
            &status_path,
            Some(json!({"status": "suspended"})),
            Some(&app.member_key),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .owner("PUT", &status_path, Some(json!({"status": "suspended"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "suspended");
    assert!(!app.state.pool.contains(DATABASE_ID).await);

    let (status, _) = app.owner("GET", &data_path("users"), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = app
        .owner("PUT", &status_path, Some(json!({"status": "active"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.owner("GET", &data_path("users"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .owner("PUT", &status_path, Some(json!({"status": "archived"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_usage_events_are_recorded_and_summarized() {
    let app = TestApp::spawn().await;
    let path = data_path("users");

    app.owner("POST", &path, Some(json!({"name": "Ada"}))).await;
    app.owner("GET", &path, None).await;
    app.owner("GET", &format!("{}/{}", path, uuid::Uuid::new_v4()), None)
        .await;
    app.owner("POST", &sql_path(), Some(json!({"query": "SELECT 1"})))
        .await;

    let mut summary = None;
    for _ in 0..100 {
        let current = app
            .state
            .metadata
            .usage_summary(&app.project_id, UsagePeriod::Hour)
            .await
            .unwrap();
        if current.api_calls == 3 && current.queries == 1 {
            summary = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let summary = summary.expect("usage events were not drained");
    assert_eq!(summary.errors, 1);

    let (status, body) = app
        .owner(
            "GET",
            &format!("/api/v1/projects/{}/usage?period=1h", app.project_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_calls"], 3);
    assert_eq!(body["queries"], 1);
    assert_eq!(body["period"], "1h");

    let (status, _) = app
        .request(
            "GET",
            &format!("/api/v1/projects/{}/usage", app.project_id),
            None,
            Some(&app.member_key),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .owner(
            "GET",
            &format!("/api/v1/projects/{}/usage?period=2w", app.project_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
