//! NebulaDB Storage
//!
//! Tenant data access and metadata persistence:
//!
//! - [`TenantStore`]: schema-driven CRUD and SQL against one logical database
//! - [`SqliteTenantStore`]: SQLite implementation with bounded connection reuse
//! - [`TenantConnectionPool`]: lazily opened, probe-checked store per database
//! - [`MetadataStore`]: projects, databases, table schemas, usage, and access checks
//!
//! All SQLite work runs inside `tokio::task::spawn_blocking`.

use nebuladb_core::{LogicalDatabase, Record, Result, TableSchema};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub mod credentials;
pub mod lifecycle;
pub mod metadata;
pub mod pool;
pub mod pool_config;
pub mod schema;
pub mod sqlite;
pub mod tenant;

pub use credentials::{derive_credential, DerivedCredential};
pub use lifecycle::DatabaseLifecycle;
pub use metadata::{
    AccessControl, DatabaseDirectory, MetadataStore, NewDatabase, SchemaSource, UsageSink,
};
pub use pool::{PoolStats, TenantConnectionPool};
pub use pool_config::ConnectionPoolConfig;
pub use schema::SchemaResolver;
pub use sqlite::{SqliteConnector, SqliteTenantStore};
pub use tenant::DatabaseId;

/// Boxed future returned by store trait methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Sort order for list queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Parse `name` (ascending) or `-name` (descending).
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('-') {
            Some(column) => Self {
                column: column.to_string(),
                descending: true,
            },
            None => Self::ascending(raw),
        }
    }
}

/// Paging, filtering, and ordering for a list call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: u32,
    pub offset: u32,
    /// Case-insensitive substring matched against text columns
    pub filter: Option<String>,
    pub sort: SortKey,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            filter: None,
            sort: SortKey::ascending(nebuladb_core::ID_COLUMN),
        }
    }
}

/// Result of a direct SQL execution
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SqlOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Rows returned (reads) or affected (writes)
    pub row_count: usize,
    /// True when a read produced more rows than were returned
    pub truncated: bool,
}

/// Data access for a single logical database.
///
/// Implementations own their physical connections. Every method takes the
/// resolved [`TableSchema`] so that no per-table code exists.
///
/// This trait uses manual async implementation (`Pin<Box<dyn Future>>`)
/// so it stays object safe behind `Arc<dyn TenantStore>`.
pub trait TenantStore: Send + Sync {
    /// Identifier of the logical database this store serves.
    fn database_id(&self) -> &str;

    /// Cheap liveness check.
    fn ping(&self) -> StoreFuture<'_, ()>;

    /// Create the physical table and its indexes.
    fn create_table<'a>(&'a self, schema: &'a TableSchema) -> StoreFuture<'a, ()>;

    /// Drop the physical table if it exists.
    fn drop_table<'a>(&'a self, table: &'a str) -> StoreFuture<'a, ()>;

    fn list<'a>(&'a self, schema: &'a TableSchema, query: &'a ListQuery)
        -> StoreFuture<'a, Vec<Record>>;

    fn get<'a>(&'a self, schema: &'a TableSchema, id: &'a str) -> StoreFuture<'a, Option<Record>>;

    /// Persist a fully stamped record and return it as stored.
    fn insert<'a>(&'a self, schema: &'a TableSchema, record: Record) -> StoreFuture<'a, Record>;

    /// Overwrite the supplied columns. `None` when `id` does not exist.
    fn update<'a>(
        &'a self,
        schema: &'a TableSchema,
        id: &'a str,
        patch: Record,
    ) -> StoreFuture<'a, Option<Record>>;

    /// Delete by id, reporting whether a row was removed.
    fn delete<'a>(&'a self, schema: &'a TableSchema, id: &'a str) -> StoreFuture<'a, bool>;

    /// Execute one tenant-supplied statement.
    fn execute_sql<'a>(&'a self, query: &'a str) -> StoreFuture<'a, SqlOutcome>;

    /// Release all physical resources. Later calls fail with `Unavailable`.
    fn close(&self) -> StoreFuture<'_, ()>;
}

/// Opens a [`TenantStore`] for a logical database.
pub trait StoreConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        database: &'a LogicalDatabase,
        credential: &'a DerivedCredential,
    ) -> StoreFuture<'a, Arc<dyn TenantStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_key_parse() {
        assert_eq!(SortKey::parse("name"), SortKey::ascending("name"));
        let desc = SortKey::parse("-created_at");
        assert_eq!(desc.column, "created_at");
        assert!(desc.descending);
    }

    #[test]
    fn test_list_query_defaults() {
        let query = ListQuery::default();
        assert_eq!(query.limit, 50);
        assert_eq!(query.offset, 0);
        assert_eq!(query.sort.column, "id");
        assert!(query.filter.is_none());
    }
}
