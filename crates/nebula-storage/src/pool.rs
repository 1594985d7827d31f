//! Per-database connection pool.
//!
//! Maps a logical database id to an open, probe-checked [`TenantStore`].
//!
//! ```text
//! TenantConnectionPool
//!        │
//!        ├── DatabaseDirectory  (id → LogicalDatabase, status check)
//!        ├── StoreConnector     (LogicalDatabase + credential → store)
//!        │
//!        ├── RwLock<HashMap>
//!        │     ├── "db-acme"  → Arc<dyn TenantStore>
//!        │     └── "db-globex" → Arc<dyn TenantStore>
//!        │
//!        └── Mutex<HashMap>    (id → opening guard, only while in use)
//! ```
//!
//! # Thread Safety
//!
//! Lookups take the shared lock. A miss takes a per-database opening guard and
//! checks again before creating, so concurrent first requests for one database
//! produce exactly one store while other databases keep being served. The map's
//! exclusive lock is only held to insert or remove. Releasing one database
//! takes the same guard, so it never interleaves with an open in flight.

use crate::credentials::derive_credential;
use crate::metadata::DatabaseDirectory;
use crate::tenant::DatabaseId;
use crate::{StoreConnector, TenantStore};
use nebuladb_core::{DatabaseStatus, NebulaError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

struct PoolEntry {
    store: Arc<dyn TenantStore>,
    created_at: Instant,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    /// Entries currently open
    pub size: usize,
    pub created_total: u64,
    pub released_total: u64,
    /// New entries discarded because the liveness probe failed or timed out
    pub probe_failures: u64,
    pub database_ids: Vec<String>,
}

/// Lazily populated map of open tenant stores.
pub struct TenantConnectionPool {
    directory: Arc<dyn DatabaseDirectory>,
    connector: Arc<dyn StoreConnector>,
    credential_secret: String,
    probe_timeout: Duration,
    entries: RwLock<HashMap<String, PoolEntry>>,
    opening: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    created_total: AtomicU64,
    released_total: AtomicU64,
    probe_failures: AtomicU64,
}

impl std::fmt::Debug for TenantConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnectionPool")
            .field("probe_timeout", &self.probe_timeout)
            .field("created_total", &self.created_total.load(Ordering::Relaxed))
            .field("released_total", &self.released_total.load(Ordering::Relaxed))
            .finish()
    }
}

impl TenantConnectionPool {
    pub fn new(
        directory: Arc<dyn DatabaseDirectory>,
        connector: Arc<dyn StoreConnector>,
        credential_secret: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            connector,
            credential_secret: credential_secret.into(),
            probe_timeout,
            entries: RwLock::new(HashMap::new()),
            opening: parking_lot::Mutex::new(HashMap::new()),
            created_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
        }
    }

    /// Get the store for `database_id`, creating and probing it on first use.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the id is malformed, unknown, or the database is deleted
    /// - `Unavailable` if the database is not active or the probe fails
    pub async fn acquire(&self, database_id: &str) -> Result<Arc<dyn TenantStore>> {
        let id = DatabaseId::new(database_id)
            .map_err(|_| NebulaError::NotFound("Database not found".to_string()))?;

        if let Some(store) = self.lookup(id.as_str()).await {
            debug!(database_id = %id, "Pool hit");
            return Ok(store);
        }

        let guard = self.opening_guard(id.as_str());
        let result = {
            let _opening = guard.lock().await;
            match self.lookup(id.as_str()).await {
                Some(store) => {
                    debug!(database_id = %id, "Pool hit after waiting for open");
                    Ok(store)
                }
                None => self.open_entry(&id).await,
            }
        };
        self.forget_guard(id.as_str(), &guard);
        result
    }

    async fn lookup(&self, database_id: &str) -> Option<Arc<dyn TenantStore>> {
        self.entries
            .read()
            .await
            .get(database_id)
            .map(|entry| Arc::clone(&entry.store))
    }

    fn opening_guard(&self, database_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.opening.lock().entry(database_id.to_string()).or_default())
    }

    /// Drop the guard from the map once no other task holds it.
    fn forget_guard(&self, database_id: &str, guard: &Arc<AsyncMutex<()>>) {
        let mut opening = self.opening.lock();
        // One reference in the map, one held by the caller.
        if Arc::strong_count(guard) <= 2 {
            opening.remove(database_id);
        }
    }

    /// Look up, connect, and probe a database not yet in the map.
    ///
    /// Runs under the database's opening guard, never under the map lock.
    async fn open_entry(&self, id: &DatabaseId) -> Result<Arc<dyn TenantStore>> {
        debug!(database_id = %id, "Pool miss");

        let database = self
            .directory
            .lookup_database(id.as_str())
            .await?
            .ok_or_else(|| NebulaError::NotFound("Database not found".to_string()))?;

        match database.status {
            DatabaseStatus::Active => {}
            DatabaseStatus::Deleted => {
                return Err(NebulaError::NotFound("Database not found".to_string()))
            }
            status => {
                return Err(NebulaError::Unavailable(format!(
                    "Database '{}' is {}",
                    id, status
                )))
            }
        }

        let credential = derive_credential(&self.credential_secret, id.as_str());
        let store = self.connector.connect(&database, &credential).await?;

        let probe = match tokio::time::timeout(self.probe_timeout, store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(NebulaError::Unavailable(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            ))),
        };
        if let Err(e) = probe {
            self.probe_failures.fetch_add(1, Ordering::Relaxed);
            warn!(database_id = %id, error = %e, "Liveness probe failed, discarding store");
            if let Err(close_err) = store.close().await {
                warn!(database_id = %id, error = %close_err, "Failed to close unhealthy store");
            }
            return Err(NebulaError::Unavailable(format!(
                "Database '{}' is not reachable",
                id
            )));
        }

        let pool_size = {
            let mut entries = self.entries.write().await;
            entries.insert(
                id.as_str().to_string(),
                PoolEntry {
                    store: Arc::clone(&store),
                    created_at: Instant::now(),
                },
            );
            entries.len()
        };
        self.created_total.fetch_add(1, Ordering::Relaxed);
        info!(
            database_id = %id,
            user = %credential.user,
            pool_size = pool_size,
            "Opened tenant store"
        );
        Ok(store)
    }

    /// Close and remove one entry. Returns whether an entry existed.
    pub async fn release(&self, database_id: &str) -> bool {
        let guard = self.opening_guard(database_id);
        let removed = {
            let _opening = guard.lock().await;
            self.entries.write().await.remove(database_id)
        };
        self.forget_guard(database_id, &guard);
        match removed {
            Some(entry) => {
                self.close_entry(database_id, entry).await;
                true
            }
            None => false,
        }
    }

    /// Close and remove every entry. Called once at shutdown.
    pub async fn release_all(&self) -> usize {
        let drained: Vec<(String, PoolEntry)> = self.entries.write().await.drain().collect();
        let count = drained.len();
        for (database_id, entry) in drained {
            self.close_entry(&database_id, entry).await;
        }
        info!(released = count, "Released all tenant stores");
        count
    }

    async fn close_entry(&self, database_id: &str, entry: PoolEntry) {
        if let Err(e) = entry.store.close().await {
            warn!(database_id = %database_id, error = %e, "Error closing tenant store");
        }
        self.released_total.fetch_add(1, Ordering::Relaxed);
        info!(
            database_id = %database_id,
            age_secs = entry.created_at.elapsed().as_secs(),
            "Released tenant store"
        );
    }

    pub async fn contains(&self, database_id: &str) -> bool {
        self.entries.read().await.contains_key(database_id)
    }

    pub async fn size(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.read().await;
        let mut database_ids: Vec<String> = entries.keys().cloned().collect();
        database_ids.sort();
        PoolStats {
            size: entries.len(),
            created_total: self.created_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            database_ids,
        }
    }
}

impl Drop for TenantConnectionPool {
    fn drop(&mut self) {
        let open = self.entries.get_mut().len();
        if open > 0 {
            debug!(open_entries = open, "Dropping connection pool with open entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DerivedCredential, ListQuery, SqlOutcome, StoreFuture};
    use async_trait::async_trait;
    use nebuladb_core::{LogicalDatabase, Record, TableSchema};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakeDirectory {
        databases: HashMap<String, DatabaseStatus>,
    }

    #[async_trait]
    impl DatabaseDirectory for FakeDirectory {
        async fn lookup_database(&self, database_id: &str) -> Result<Option<LogicalDatabase>> {
            Ok(self.databases.get(database_id).map(|status| LogicalDatabase {
                id: database_id.to_string(),
                project_id: "proj".to_string(),
                name: "main".to_string(),
                connection_descriptor: None,
                status: *status,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            }))
        }
    }

    struct FakeStore {
        id: String,
        healthy: bool,
        closed: Arc<AtomicBool>,
    }

    impl TenantStore for FakeStore {
        fn database_id(&self) -> &str {
            &self.id
        }
        fn ping(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                if self.healthy {
                    Ok(())
                } else {
                    Err(NebulaError::Unavailable("down".to_string()))
                }
            })
        }
        fn create_table<'a>(&'a self, _schema: &'a TableSchema) -> StoreFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn drop_table<'a>(&'a self, _table: &'a str) -> StoreFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn list<'a>(&'a self, _s: &'a TableSchema, _q: &'a ListQuery) -> StoreFuture<'a, Vec<Record>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn get<'a>(&'a self, _s: &'a TableSchema, _id: &'a str) -> StoreFuture<'a, Option<Record>> {
            Box::pin(async { Ok(None) })
        }
        fn insert<'a>(&'a self, _s: &'a TableSchema, record: Record) -> StoreFuture<'a, Record> {
            Box::pin(async move { Ok(record) })
        }
        fn update<'a>(
            &'a self,
            _s: &'a TableSchema,
            _id: &'a str,
            _patch: Record,
        ) -> StoreFuture<'a, Option<Record>> {
            Box::pin(async { Ok(None) })
        }
        fn delete<'a>(&'a self, _s: &'a TableSchema, _id: &'a str) -> StoreFuture<'a, bool> {
            Box::pin(async { Ok(false) })
        }
        fn execute_sql<'a>(&'a self, _query: &'a str) -> StoreFuture<'a, SqlOutcome> {
            Box::pin(async { Ok(SqlOutcome::default()) })
        }
        fn close(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct FakeConnector {
        connects: AtomicUsize,
        healthy: bool,
        delay: Duration,
        slow_database: Option<(&'static str, Duration)>,
        last_closed: Arc<AtomicBool>,
    }

    impl FakeConnector {
        fn new(healthy: bool) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                healthy,
                delay: Duration::from_millis(20),
                slow_database: None,
                last_closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl StoreConnector for FakeConnector {
        fn connect<'a>(
            &'a self,
            database: &'a LogicalDatabase,
            credential: &'a DerivedCredential,
        ) -> StoreFuture<'a, Arc<dyn TenantStore>> {
            Box::pin(async move {
                assert!(credential.user.starts_with("nb_"));
                self.connects.fetch_add(1, Ordering::SeqCst);
                let delay = match self.slow_database {
                    Some((id, delay)) if id == database.id => delay,
                    _ => self.delay,
                };
                tokio::time::sleep(delay).await;
                Ok(Arc::new(FakeStore {
                    id: database.id.clone(),
                    healthy: self.healthy,
                    closed: Arc::clone(&self.last_closed),
                }) as Arc<dyn TenantStore>)
            })
        }
    }

    fn directory() -> Arc<FakeDirectory> {
        let mut databases = HashMap::new();
        databases.insert("db-active".to_string(), DatabaseStatus::Active);
        databases.insert("db-other".to_string(), DatabaseStatus::Active);
        databases.insert("db-slow".to_string(), DatabaseStatus::Active);
        databases.insert("db-suspended".to_string(), DatabaseStatus::Suspended);
        databases.insert("db-provisioning".to_string(), DatabaseStatus::Provisioning);
        databases.insert("db-deleted".to_string(), DatabaseStatus::Deleted);
        Arc::new(FakeDirectory { databases })
    }

    fn pool(connector: Arc<FakeConnector>) -> Arc<TenantConnectionPool> {
        Arc::new(TenantConnectionPool::new(
            directory(),
            connector,
            "secret",
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn test_concurrent_acquire_connects_once() {
        let connector = Arc::new(FakeConnector::new(true));
        let pool = pool(Arc::clone(&connector));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.acquire("db-active").await }));
        }
        for handle in handles {
            let store = handle.await.unwrap().unwrap();
            assert_eq!(store.database_id(), "db-active");
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        let stats = pool.stats().await;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.created_total, 1);
    }

    #[tokio::test]
    async fn test_slow_open_does_not_block_other_databases() {
        let connector = Arc::new(FakeConnector {
            slow_database: Some(("db-slow", Duration::from_millis(1500))),
            ..FakeConnector::new(true)
        });
        let pool = pool(Arc::clone(&connector));
        pool.acquire("db-active").await.unwrap();

        let slow = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire("db-slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!slow.is_finished());

        // A cached hit and a fresh open of another id both finish while db-slow is connecting.
        let quick = Duration::from_millis(300);
        let hit = tokio::time::timeout(quick, pool.acquire("db-active")).await;
        assert!(hit.expect("cached acquire blocked").is_ok());
        let other = tokio::time::timeout(quick, pool.acquire("db-other")).await;
        assert!(other.expect("other open blocked").is_ok());
        assert!(!slow.is_finished());

        assert_eq!(slow.await.unwrap().unwrap().database_id(), "db-slow");
        assert_eq!(pool.size().await, 3);
        assert!(pool.opening.lock().is_empty());
    }

    #[tokio::test]
    async fn test_status_gates_acquire() {
        let connector = Arc::new(FakeConnector::new(true));
        let pool = pool(Arc::clone(&connector));

        assert!(matches!(
            pool.acquire("db-unknown").await,
            Err(NebulaError::NotFound(_))
        ));
        assert!(matches!(
            pool.acquire("db-deleted").await,
            Err(NebulaError::NotFound(_))
        ));
        assert!(matches!(
            pool.acquire("db-suspended").await,
            Err(NebulaError::Unavailable(_))
        ));
        assert!(matches!(
            pool.acquire("db-provisioning").await,
            Err(NebulaError::Unavailable(_))
        ));
        assert!(matches!(
            pool.acquire("../etc").await,
            Err(NebulaError::NotFound(_))
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_leaves_no_entry() {
        let connector = Arc::new(FakeConnector::new(false));
        let pool = pool(Arc::clone(&connector));

        let result = pool.acquire("db-active").await;
        assert!(matches!(result, Err(NebulaError::Unavailable(_))));
        assert!(!pool.contains("db-active").await);
        assert!(connector.last_closed.load(Ordering::SeqCst));
        assert_eq!(pool.stats().await.probe_failures, 1);

        // No retry inside acquire; the next call tries again from scratch.
        let _ = pool.acquire("db-active").await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_and_release_all() {
        let connector = Arc::new(FakeConnector::new(true));
        let pool = pool(Arc::clone(&connector));

        pool.acquire("db-active").await.unwrap();
        assert!(pool.release("db-active").await);
        assert!(!pool.release("db-active").await);
        assert!(connector.last_closed.load(Ordering::SeqCst));

        pool.acquire("db-active").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.release_all().await, 1);
        assert_eq!(pool.size().await, 0);
        assert_eq!(pool.stats().await.released_total, 2);
    }

    #[tokio::test]
    async fn test_release_concurrent_with_acquire() {
        let connector = Arc::new(FakeConnector::new(true));
        let pool = pool(Arc::clone(&connector));

        let mut handles = Vec::new();
        for i in 0..20 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    pool.release("db-active").await;
                } else {
                    pool.acquire("db-active").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(pool.size().await <= 1);
        assert!(pool.opening.lock().is_empty());
    }
}
