//! Pool and tenant store behavior across several logical databases.

use nebuladb_core::{
    now_timestamp, ColumnDef, ColumnType, DatabaseStatus, FieldValue, NebulaError, Record,
    TableSchema, CREATED_AT_COLUMN, ID_COLUMN,
};
use nebuladb_storage::{
    ConnectionPoolConfig, DatabaseLifecycle, ListQuery, MetadataStore, NewDatabase,
    SqliteConnector, TenantConnectionPool,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    metadata: Arc<MetadataStore>,
    pool: Arc<TenantConnectionPool>,
    project_id: String,
    temp_dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let metadata = Arc::new(MetadataStore::open(temp_dir.path().join("meta.db")).unwrap());
        let project = metadata.create_project("acme", "alice").await.unwrap();

        let template = format!("{}/tenants/{{database_id}}.db", temp_dir.path().display());
        let connector = SqliteConnector::new(template, ConnectionPoolConfig::default()).unwrap();
        let pool = Arc::new(TenantConnectionPool::new(
            metadata.clone(),
            Arc::new(connector),
            "test-secret",
            Duration::from_secs(2),
        ));

        Self {
            metadata,
            pool,
            project_id: project.id,
            temp_dir,
        }
    }

    async fn add_database(&self, id: &str, descriptor: Option<String>) {
        self.metadata
            .create_database(NewDatabase {
                id: Some(id.to_string()),
                project_id: self.project_id.clone(),
                name: id.to_string(),
                connection_descriptor: descriptor,
                status: DatabaseStatus::Active,
            })
            .await
            .unwrap();
    }
}

fn notes_schema() -> TableSchema {
    TableSchema {
        name: "notes".to_string(),
        columns: vec![ColumnDef {
            name: "body".to_string(),
            column_type: ColumnType::Text,
            required: true,
            unique: false,
        }],
        indexes: vec![],
        api_enabled: true,
    }
}

fn note(body: &str) -> Record {
    let mut record = Record::new();
    record.insert(ID_COLUMN, FieldValue::Text(uuid::Uuid::new_v4().to_string()));
    record.insert(CREATED_AT_COLUMN, FieldValue::Text(now_timestamp()));
    record.insert("body", FieldValue::Text(body.to_string()));
    record
}

#[tokio::test]
async fn test_same_table_name_is_isolated_per_database() {
    let harness = Harness::new().await;
    harness.add_database("db-one", None).await;
    harness.add_database("db-two", None).await;
    let schema = notes_schema();

    let one = harness.pool.acquire("db-one").await.unwrap();
    let two = harness.pool.acquire("db-two").await.unwrap();
    one.create_table(&schema).await.unwrap();
    two.create_table(&schema).await.unwrap();

    let stored = one.insert(&schema, note("only in one")).await.unwrap();
    let id = stored.id().unwrap().to_string();

    assert_eq!(one.list(&schema, &ListQuery::default()).await.unwrap().len(), 1);
    assert!(two.list(&schema, &ListQuery::default()).await.unwrap().is_empty());
    assert!(two.get(&schema, &id).await.unwrap().is_none());
    assert!(!two.delete(&schema, &id).await.unwrap());
    assert!(one.get(&schema, &id).await.unwrap().is_some());

    assert!(harness.temp_dir.path().join("tenants/db-one.db").exists());
    assert!(harness.temp_dir.path().join("tenants/db-two.db").exists());
}

#[tokio::test]
async fn test_connection_descriptor_overrides_template() {
    let harness = Harness::new().await;
    let custom = harness.temp_dir.path().join("custom/{database_id}.sqlite");
    harness
        .add_database("db-custom", Some(format!("sqlite://{}", custom.display())))
        .await;

    let store = harness.pool.acquire("db-custom").await.unwrap();
    store.create_table(&notes_schema()).await.unwrap();

    assert!(harness
        .temp_dir
        .path()
        .join("custom/db-custom.sqlite")
        .exists());
    assert!(!harness.temp_dir.path().join("tenants/db-custom.db").exists());
}

#[tokio::test]
async fn test_concurrent_first_acquire_opens_one_store() {
    let harness = Harness::new().await;
    harness.add_database("db-busy", None).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pool = harness.pool.clone();
        handles.push(tokio::spawn(async move { pool.acquire("db-busy").await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stats = harness.pool.stats().await;
    assert_eq!(stats.size, 1);
    assert_eq!(stats.created_total, 1);
    assert_eq!(stats.database_ids, vec!["db-busy".to_string()]);
}

#[tokio::test]
async fn test_unknown_and_unsupported_databases() {
    let harness = Harness::new().await;
    harness
        .add_database("db-remote", Some("postgres://db.internal/acme".to_string()))
        .await;

    assert!(matches!(
        harness.pool.acquire("db-missing").await,
        Err(NebulaError::NotFound(_))
    ));
    assert!(matches!(
        harness.pool.acquire("../etc").await,
        Err(NebulaError::NotFound(_))
    ));
    assert!(matches!(
        harness.pool.acquire("db-remote").await,
        Err(NebulaError::Unavailable(_))
    ));
    assert_eq!(harness.pool.size().await, 0);
}

#[tokio::test]
async fn test_release_all_closes_every_store() {
    let harness = Harness::new().await;
    harness.add_database("db-one", None).await;
    harness.add_database("db-two", None).await;
    let lifecycle = DatabaseLifecycle::new(harness.metadata.clone(), harness.pool.clone());

    let one = harness.pool.acquire("db-one").await.unwrap();
    harness.pool.acquire("db-two").await.unwrap();

    lifecycle
        .set_status("db-two", DatabaseStatus::Suspended)
        .await
        .unwrap();
    assert_eq!(harness.pool.size().await, 1);

    assert_eq!(harness.pool.release_all().await, 1);
    assert_eq!(harness.pool.size().await, 0);
    assert!(matches!(one.ping().await, Err(NebulaError::Unavailable(_))));

    let stats = harness.pool.stats().await;
    assert_eq!(stats.released_total, 2);
}
