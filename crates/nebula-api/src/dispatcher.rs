//! Generic CRUD dispatch over tenant tables.
//!
//! Every verb runs the same pipeline: access check, database lookup, schema
//! resolution, pool acquisition, then the store operation. No code is specific
//! to a table; the resolved [`TableSchema`] drives validation and SQL.
//!
//! Each call, successful or not, enqueues one usage event carrying the
//! endpoint, verb, duration, and resulting status.

use crate::api_keys::Principal;
use crate::error::status_for;
use crate::usage::UsageRecorder;
use axum::http::StatusCode;
use nebuladb_core::validation::{validate_new_record, validate_record_patch, validate_sql_statement};
use nebuladb_core::{
    now_timestamp, FieldValue, LogicalDatabase, NebulaError, Record, Result, TableSchema,
    UsageEvent, UsageEventType, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN,
};
use nebuladb_storage::{
    AccessControl, DatabaseDirectory, ListQuery, SchemaResolver, SortKey, SqlOutcome,
    TenantConnectionPool, TenantStore,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Page size when `limit` is not supplied
pub const DEFAULT_LIMIT: u32 = 50;

/// Largest page served; larger requests are clamped
pub const MAX_LIMIT: u32 = 100;

/// Longest query text copied into a usage event
const MAX_LOGGED_QUERY_LEN: usize = 1000;

/// One page of a list call
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListPage {
    pub data: Vec<Record>,
    pub count: usize,
    pub limit: u32,
    pub offset: u32,
}

/// Result of a direct SQL call
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SqlResponse {
    #[serde(flatten)]
    pub outcome: SqlOutcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parse `limit`, `offset`, `filter`, and `sort` query parameters.
///
/// `limit` above [`MAX_LIMIT`] is clamped. Non-numeric values are rejected.
pub fn parse_list_query(params: &HashMap<String, String>) -> Result<ListQuery> {
    let mut query = ListQuery {
        limit: DEFAULT_LIMIT,
        ..ListQuery::default()
    };

    if let Some(raw) = params.get("limit") {
        let limit: u32 = raw.trim().parse().map_err(|_| {
            NebulaError::ValidationError(format!("Invalid limit '{}': expected a non-negative integer", raw))
        })?;
        query.limit = limit.min(MAX_LIMIT);
    }

    if let Some(raw) = params.get("offset") {
        query.offset = raw.trim().parse().map_err(|_| {
            NebulaError::ValidationError(format!("Invalid offset '{}': expected a non-negative integer", raw))
        })?;
    }

    query.filter = params
        .get("filter")
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(str::to_string);

    if let Some(raw) = params.get("sort").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        query.sort = SortKey::parse(raw);
    }

    Ok(query)
}

/// Identifies one dispatched call for logging and usage
struct Call<'a> {
    operation: &'static str,
    method: &'static str,
    endpoint: String,
    database_id: &'a str,
    table: &'a str,
    success: StatusCode,
}

/// Everything a verb needs once the request is authorized
struct Target {
    schema: TableSchema,
    store: Arc<dyn TenantStore>,
}

/// Serves list/get/create/update/delete against any registered table.
#[derive(Clone)]
pub struct CrudDispatcher {
    access: Arc<dyn AccessControl>,
    directory: Arc<dyn DatabaseDirectory>,
    schemas: SchemaResolver,
    pool: Arc<TenantConnectionPool>,
    usage: UsageRecorder,
}

impl std::fmt::Debug for CrudDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrudDispatcher")
            .field("pool", &self.pool)
            .field("usage", &self.usage.stats())
            .finish()
    }
}

impl CrudDispatcher {
    pub fn new(
        access: Arc<dyn AccessControl>,
        directory: Arc<dyn DatabaseDirectory>,
        schemas: SchemaResolver,
        pool: Arc<TenantConnectionPool>,
        usage: UsageRecorder,
    ) -> Self {
        Self {
            access,
            directory,
            schemas,
            pool,
            usage,
        }
    }

    pub fn pool(&self) -> &Arc<TenantConnectionPool> {
        &self.pool
    }

    /// Check that `principal` may use `database_id` and return the database.
    ///
    /// Access is checked first, so an unknown database is indistinguishable
    /// from one the caller cannot see.
    pub async fn authorize(&self, principal: &Principal, database_id: &str) -> Result<LogicalDatabase> {
        if !self.access.has_access(&principal.user_id, database_id).await? {
            debug!(user_id = %principal.user_id, database_id = %database_id, "Access denied");
            return Err(NebulaError::AccessDenied("Access denied".to_string()));
        }
        self.directory
            .lookup_database(database_id)
            .await?
            .ok_or_else(|| NebulaError::NotFound("Database not found".to_string()))
    }

    async fn resolve_target(
        &self,
        principal: &Principal,
        database_id: &str,
        table: &str,
        project_id: &mut Option<String>,
    ) -> Result<Target> {
        let database = self.authorize(principal, database_id).await?;
        *project_id = Some(database.project_id);

        let schema = self.schemas.resolve(database_id, table).await?;
        if !schema.api_enabled {
            debug!(database_id = %database_id, table = %table, "Table not served by the data API");
            return Err(NebulaError::NotFound("Table not found".to_string()));
        }

        let store = self.pool.acquire(database_id).await?;
        Ok(Target { schema, store })
    }

    async fn dispatch<T, F, Fut>(&self, principal: &Principal, call: Call<'_>, op: F) -> Result<T>
    where
        F: FnOnce(Target) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut project_id = None;
        let result = match self
            .resolve_target(principal, call.database_id, call.table, &mut project_id)
            .await
        {
            Ok(target) => op(target).await,
            Err(e) => Err(e),
        };

        let status = match &result {
            Ok(_) => call.success,
            Err(e) => status_for(e),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            operation = call.operation,
            database_id = %call.database_id,
            table = %call.table,
            status = status.as_u16(),
            duration_ms = duration_ms,
            "Dispatched data operation"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_data_operation(call.operation, status.as_u16());

        self.usage.record(UsageEvent::new(
            project_id,
            Some(call.database_id.to_string()),
            UsageEventType::ApiCall,
            json!({
                "endpoint": call.endpoint,
                "method": call.method,
                "table": call.table,
                "duration_ms": duration_ms,
                "status_code": status.as_u16(),
            }),
        ));

        result
    }

    fn collection_endpoint(database_id: &str, table: &str) -> String {
        format!("/api/v1/databases/{}/data/{}", database_id, table)
    }

    fn item_endpoint(database_id: &str, table: &str, id: &str) -> String {
        format!("/api/v1/databases/{}/data/{}/{}", database_id, table, id)
    }

    pub async fn list(
        &self,
        principal: &Principal,
        database_id: &str,
        table: &str,
        params: &HashMap<String, String>,
    ) -> Result<ListPage> {
        let call = Call {
            operation: "list",
            method: "GET",
            endpoint: Self::collection_endpoint(database_id, table),
            database_id,
            table,
            success: StatusCode::OK,
        };
        self.dispatch(principal, call, |target| async move {
            let query = parse_list_query(params)?;
            if !target.schema.is_sortable(&query.sort.column) {
                return Err(NebulaError::ValidationError(format!(
                    "Cannot sort by unknown column '{}'",
                    query.sort.column
                )));
            }
            let data = target.store.list(&target.schema, &query).await?;
            Ok(ListPage {
                count: data.len(),
                data,
                limit: query.limit,
                offset: query.offset,
            })
        })
        .await
    }

    pub async fn get(&self, principal: &Principal, database_id: &str, table: &str, id: &str) -> Result<Record> {
        let call = Call {
            operation: "get",
            method: "GET",
            endpoint: Self::item_endpoint(database_id, table, id),
            database_id,
            table,
            success: StatusCode::OK,
        };
        self.dispatch(principal, call, |target| async move {
            target
                .store
                .get(&target.schema, id)
                .await?
                .ok_or_else(|| NebulaError::NotFound("Record not found".to_string()))
        })
        .await
    }

    /// Validate, stamp `id` and `created_at`, and persist a new record.
    pub async fn create(
        &self,
        principal: &Principal,
        database_id: &str,
        table: &str,
        body: &serde_json::Value,
    ) -> Result<Record> {
        let call = Call {
            operation: "create",
            method: "POST",
            endpoint: Self::collection_endpoint(database_id, table),
            database_id,
            table,
            success: StatusCode::CREATED,
        };
        self.dispatch(principal, call, |target| async move {
            let data = body.as_object().ok_or_else(|| {
                NebulaError::ValidationError("Request body must be a JSON object".to_string())
            })?;
            let mut record = validate_new_record(&target.schema, data)?;
            record.insert(ID_COLUMN, FieldValue::Text(uuid::Uuid::new_v4().to_string()));
            record.insert(CREATED_AT_COLUMN, FieldValue::Text(now_timestamp()));
            target.store.insert(&target.schema, record).await
        })
        .await
    }

    /// Overwrite the supplied columns and stamp `updated_at`.
    pub async fn update(
        &self,
        principal: &Principal,
        database_id: &str,
        table: &str,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<Record> {
        let call = Call {
            operation: "update",
            method: "PUT",
            endpoint: Self::item_endpoint(database_id, table, id),
            database_id,
            table,
            success: StatusCode::OK,
        };
        self.dispatch(principal, call, |target| async move {
            let data = body.as_object().ok_or_else(|| {
                NebulaError::ValidationError("Request body must be a JSON object".to_string())
            })?;
            let mut patch = validate_record_patch(&target.schema, data)?;
            patch.insert(UPDATED_AT_COLUMN, FieldValue::Text(now_timestamp()));
            target
                .store
                .update(&target.schema, id, patch)
                .await?
                .ok_or_else(|| NebulaError::NotFound("Record not found".to_string()))
        })
        .await
    }

    /// Delete by id. Deleting an absent id succeeds; the flag reports whether a row existed.
    pub async fn delete(&self, principal: &Principal, database_id: &str, table: &str, id: &str) -> Result<bool> {
        let call = Call {
            operation: "delete",
            method: "DELETE",
            endpoint: Self::item_endpoint(database_id, table, id),
            database_id,
            table,
            success: StatusCode::OK,
        };
        self.dispatch(principal, call, |target| async move {
            target.store.delete(&target.schema, id).await
        })
        .await
    }

    /// Run one tenant-supplied statement and record a `query` usage event.
    pub async fn execute_sql(&self, principal: &Principal, database_id: &str, query: &str) -> Result<SqlResponse> {
        let start = Instant::now();
        let mut project_id = None;

        let result = async {
            let database = self.authorize(principal, database_id).await?;
            project_id = Some(database.project_id);
            validate_sql_statement(query)?;
            let store = self.pool.acquire(database_id).await?;
            store.execute_sql(query).await
        }
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let status = match &result {
            Ok(_) => StatusCode::OK,
            Err(e) => status_for(e),
        };
        #[cfg(feature = "metrics")]
        crate::metrics::record_data_operation("sql", status.as_u16());

        let logged_query: String = query.chars().take(MAX_LOGGED_QUERY_LEN).collect();
        self.usage.record(UsageEvent::new(
            project_id,
            Some(database_id.to_string()),
            UsageEventType::Query,
            json!({
                "query": logged_query,
                "duration_ms": duration_ms,
                "status_code": status.as_u16(),
            }),
        ));

        let outcome = result?;
        let message = statement_message(query, &outcome);
        Ok(SqlResponse {
            outcome,
            duration_ms,
            message,
        })
    }
}

/// Command tag for statements that return no columns, e.g. `INSERT 3`.
fn statement_message(query: &str, outcome: &SqlOutcome) -> Option<String> {
    if !outcome.columns.is_empty() {
        return None;
    }
    let verb = query
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    match verb.as_str() {
        "INSERT" | "UPDATE" | "DELETE" => Some(format!("{} {}", verb, outcome.row_count)),
        _ => Some("Query executed successfully".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_list_query_defaults() {
        let query = parse_list_query(&HashMap::new()).unwrap();
        assert_eq!(query.limit, 50);
        assert_eq!(query.offset, 0);
        assert_eq!(query.sort, SortKey::ascending("id"));
        assert!(query.filter.is_none());
    }

    #[test]
    fn test_list_query_clamps_limit() {
        let query = parse_list_query(&params(&[("limit", "500")])).unwrap();
        assert_eq!(query.limit, 100);
        let query = parse_list_query(&params(&[("limit", "0")])).unwrap();
        assert_eq!(query.limit, 0);
    }

    #[test]
    fn test_list_query_rejects_garbage() {
        assert!(matches!(
            parse_list_query(&params(&[("limit", "ten")])),
            Err(NebulaError::ValidationError(_))
        ));
        assert!(matches!(
            parse_list_query(&params(&[("offset", "-1")])),
            Err(NebulaError::ValidationError(_))
        ));
    }

    #[test]
    fn test_list_query_filter_and_sort() {
        let query = parse_list_query(&params(&[
            ("filter", "  ali "),
            ("sort", "-created_at"),
            ("offset", "20"),
        ]))
        .unwrap();
        assert_eq!(query.filter.as_deref(), Some("ali"));
        assert_eq!(query.sort.column, "created_at");
        assert!(query.sort.descending);
        assert_eq!(query.offset, 20);

        let query = parse_list_query(&params(&[("filter", "   "), ("sort", "")])).unwrap();
        assert!(query.filter.is_none());
        assert_eq!(query.sort.column, "id");
    }

    #[test]
    fn test_statement_message() {
        let write = SqlOutcome {
            row_count: 3,
            ..Default::default()
        };
        assert_eq!(
            statement_message("  insert into t values (1)", &write).as_deref(),
            Some("INSERT 3")
        );
        assert_eq!(
            statement_message("CREATE TABLE t (a)", &SqlOutcome::default()).as_deref(),
            Some("Query executed successfully")
        );

        let read = SqlOutcome {
            columns: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(statement_message("SELECT 1 AS a", &read).is_none());
    }
}
