//! Table schema resolution.

use crate::metadata::SchemaSource;
use nebuladb_core::{NebulaError, Result, TableSchema};
use std::sync::Arc;
use tracing::debug;

/// Resolves a table's stored schema for the data API.
///
/// Reads go straight to the [`SchemaSource`] on every call, so a schema change
/// is visible to the next request.
#[derive(Clone)]
pub struct SchemaResolver {
    source: Arc<dyn SchemaSource>,
}

impl SchemaResolver {
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self { source }
    }

    /// Look up `table` in `database_id`, failing with `NotFound` if absent.
    pub async fn resolve(&self, database_id: &str, table: &str) -> Result<TableSchema> {
        match self.source.find_table(database_id, table).await? {
            Some(schema) => Ok(schema),
            None => {
                debug!(database_id = %database_id, table = %table, "Table schema not found");
                Err(NebulaError::NotFound("Table not found".to_string()))
            }
        }
    }
}
