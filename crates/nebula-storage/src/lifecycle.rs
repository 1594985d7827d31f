//! Database lifecycle transitions.

use crate::metadata::MetadataStore;
use crate::pool::TenantConnectionPool;
use nebuladb_core::{DatabaseStatus, LogicalDatabase, Result};
use std::sync::Arc;
use tracing::info;

/// Applies status changes to the metadata store and keeps the pool consistent.
#[derive(Debug, Clone)]
pub struct DatabaseLifecycle {
    metadata: Arc<MetadataStore>,
    pool: Arc<TenantConnectionPool>,
}

impl DatabaseLifecycle {
    pub fn new(metadata: Arc<MetadataStore>, pool: Arc<TenantConnectionPool>) -> Self {
        Self { metadata, pool }
    }

    /// Persist `status`. Leaving `active` closes the database's pool entry so
    /// the next request sees the new status.
    pub async fn set_status(&self, database_id: &str, status: DatabaseStatus) -> Result<LogicalDatabase> {
        let database = self.metadata.set_database_status(database_id, status).await?;
        if !status.is_operational() && self.pool.release(database_id).await {
            info!(
                database_id = %database_id,
                status = %status,
                "Released pool entry after status change"
            );
        }
        Ok(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NewDatabase;
    use crate::{ConnectionPoolConfig, SqliteConnector};
    use nebuladb_core::NebulaError;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_suspend_releases_entry_and_blocks_acquire() {
        let temp_dir = TempDir::new().unwrap();
        let metadata = Arc::new(MetadataStore::open(temp_dir.path().join("meta.db")).unwrap());
        let project = metadata.create_project("acme", "alice").await.unwrap();
        metadata
            .create_database(NewDatabase {
                id: Some("db-acme".to_string()),
                project_id: project.id,
                name: "main".to_string(),
                connection_descriptor: None,
                status: DatabaseStatus::Active,
            })
            .await
            .unwrap();

        let template = format!("{}/{{database_id}}.db", temp_dir.path().display());
        let connector = SqliteConnector::new(template, ConnectionPoolConfig::default()).unwrap();
        let pool = Arc::new(TenantConnectionPool::new(
            metadata.clone(),
            Arc::new(connector),
            "secret",
            Duration::from_secs(2),
        ));
        let lifecycle = DatabaseLifecycle::new(metadata.clone(), pool.clone());

        pool.acquire("db-acme").await.unwrap();
        assert!(pool.contains("db-acme").await);

        let suspended = lifecycle
            .set_status("db-acme", DatabaseStatus::Suspended)
            .await
            .unwrap();
        assert_eq!(suspended.status, DatabaseStatus::Suspended);
        assert!(!pool.contains("db-acme").await);
        assert!(matches!(
            pool.acquire("db-acme").await,
            Err(NebulaError::Unavailable(_))
        ));

        lifecycle
            .set_status("db-acme", DatabaseStatus::Active)
            .await
            .unwrap();
        pool.acquire("db-acme").await.unwrap();
    }
}
