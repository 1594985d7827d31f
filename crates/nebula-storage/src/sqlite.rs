//! SQLite tenant stores.
//!
//! Each [`SqliteTenantStore`] serves one logical database file and keeps a
//! small set of reusable connections:
//!
//! ```text
//! SqliteTenantStore
//!        │
//!        ├── Semaphore (max_open permits)
//!        │
//!        └── idle connections (≤ max_idle, each younger than max_lifetime)
//! ```
//!
//! Connections are opened lazily on first use. A new connection verifies the
//! tenant credential fingerprint stored in the file before any query runs.
//!
//! Connections can never attach another file. Tenant-authored SQL additionally
//! runs under an authorizer that rejects pragmas, triggers, extension loading,
//! and any access to the store's own `_nebula` tables.

use crate::pool_config::ConnectionPoolConfig;
use crate::tenant::DatabaseId;
use crate::{
    DerivedCredential, ListQuery, SqlOutcome, StoreConnector, StoreFuture, TenantStore,
};
use nebuladb_core::validation::{
    quote_identifier, validate_table_name, validate_table_schema,
};
use nebuladb_core::{
    now_timestamp, FieldValue, LogicalDatabase, NebulaError, Record, Result, TableSchema,
    CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN,
};
use parking_lot::Mutex;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::limits::Limit;
use rusqlite::{params_from_iter, Batch, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Placeholder for the database id in storage templates.
pub const DATABASE_ID_PLACEHOLDER: &str = "{database_id}";

/// Maximum rows returned by one direct SQL read.
pub const MAX_SQL_ROWS: usize = 1000;

const SQLITE_SCHEME: &str = "sqlite://";
const CREDENTIALS_TABLE: &str = "_nebula_credentials";
const INTERNAL_TABLE_PREFIX: &str = "_nebula";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Connection Slots
// =============================================================================

struct PooledConnection {
    conn: Connection,
    opened_at: Instant,
}

/// Shared connection state, moved into blocking tasks.
struct ConnectionSlots {
    path: PathBuf,
    fingerprint: String,
    config: ConnectionPoolConfig,
    idle: Mutex<Vec<PooledConnection>>,
    closed: AtomicBool,
    opened_total: AtomicU64,
}

impl ConnectionSlots {
    /// Reuse a live idle connection or open a new one.
    fn checkout(&self) -> Result<PooledConnection> {
        {
            let mut idle = self.idle.lock();
            while let Some(pooled) = idle.pop() {
                if pooled.opened_at.elapsed() < self.config.max_lifetime {
                    return Ok(pooled);
                }
                debug!(path = %self.path.display(), "Closing expired tenant connection");
            }
        }

        let conn = open_connection(&self.path, &self.fingerprint)?;
        let total = self.opened_total.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(path = %self.path.display(), opened_total = total, "Opened tenant connection");
        Ok(PooledConnection {
            conn,
            opened_at: Instant::now(),
        })
    }

    /// Return a connection, keeping it only if it is reusable and there is room.
    fn checkin(&self, pooled: PooledConnection) {
        if self.closed.load(Ordering::Acquire)
            || pooled.opened_at.elapsed() >= self.config.max_lifetime
        {
            return;
        }
        // A statement like BEGIN can leave a transaction open; never hand that to the next caller.
        if !pooled.conn.is_autocommit() {
            warn!(path = %self.path.display(), "Discarding tenant connection with open transaction");
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push(pooled);
        }
    }
}

fn open_connection(path: &Path, fingerprint: &str) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Also blocks VACUUM INTO, which attaches its target internally.
    let _previous = conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0);
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    verify_credential(&conn, fingerprint)?;
    Ok(conn)
}

/// Bind the file to the first credential that opens it; reject any other.
fn verify_credential(conn: &Connection, fingerprint: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
           id INTEGER PRIMARY KEY CHECK (id = 1),
           fingerprint TEXT NOT NULL,
           created_at TEXT NOT NULL
         );",
        CREDENTIALS_TABLE
    ))?;
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} (id, fingerprint, created_at) VALUES (1, ?1, ?2)",
            CREDENTIALS_TABLE
        ),
        rusqlite::params![fingerprint, now_timestamp()],
    )?;
    let stored: String = conn.query_row(
        &format!("SELECT fingerprint FROM {} WHERE id = 1", CREDENTIALS_TABLE),
        [],
        |row| row.get(0),
    )?;
    if stored != fingerprint {
        return Err(NebulaError::Unavailable(
            "Tenant store credential mismatch".to_string(),
        ));
    }
    Ok(())
}

// =============================================================================
// SQL Helpers
// =============================================================================

fn select_list(schema: &TableSchema) -> String {
    schema
        .all_columns()
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_record(row: &rusqlite::Row<'_>, schema: &TableSchema) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    for (idx, name) in schema.all_columns().into_iter().enumerate() {
        let value = FieldValue::from_sql(row.get_ref(idx)?, schema.column_type(name)).map_err(
            |e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            },
        )?;
        record.insert(name, value);
    }
    Ok(record)
}

fn fetch_by_id(conn: &Connection, schema: &TableSchema, id: &str) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        select_list(schema),
        quote_identifier(&schema.name),
        quote_identifier(ID_COLUMN)
    );
    Ok(conn
        .query_row(&sql, [id], |row| read_record(row, schema))
        .optional()?)
}

/// Every key must be a declared or system column of `schema`.
fn ensure_known_columns(schema: &TableSchema, record: &Record) -> Result<()> {
    for (name, _) in record.iter() {
        if schema.column_type(name).is_none() {
            return Err(NebulaError::ValidationError(format!(
                "Unknown column '{}' for table '{}'",
                name, schema.name
            )));
        }
    }
    Ok(())
}

fn escape_like(filter: &str) -> String {
    let mut escaped = String::with_capacity(filter.len() + 2);
    for c in filter.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Build the paged select for `query`. Only schema columns reach the SQL text.
fn build_list_sql(schema: &TableSchema, query: &ListQuery) -> Result<(String, Vec<FieldValue>)> {
    if !schema.is_sortable(&query.sort.column) {
        return Err(NebulaError::ValidationError(format!(
            "Cannot sort by unknown column '{}'",
            query.sort.column
        )));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list(schema),
        quote_identifier(&schema.name)
    );
    let mut params = Vec::new();

    if let Some(filter) = query.filter.as_deref() {
        let predicates = schema
            .searchable_columns()
            .iter()
            .map(|c| format!("{} LIKE ?1 ESCAPE '\\'", quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(" OR ");
        sql.push_str(&format!(" WHERE ({})", predicates));
        params.push(FieldValue::Text(format!("%{}%", escape_like(filter))));
    }

    let direction = if query.sort.descending { "DESC" } else { "ASC" };
    sql.push_str(&format!(
        " ORDER BY {} {}",
        quote_identifier(&query.sort.column),
        direction
    ));
    if query.sort.column != ID_COLUMN {
        sql.push_str(&format!(", {} ASC", quote_identifier(ID_COLUMN)));
    }

    let next = params.len();
    sql.push_str(&format!(" LIMIT ?{} OFFSET ?{}", next + 1, next + 2));
    params.push(FieldValue::Integer(i64::from(query.limit)));
    params.push(FieldValue::Integer(i64::from(query.offset)));

    Ok((sql, params))
}

fn create_table_ddl(schema: &TableSchema) -> String {
    let mut columns = vec![format!("{} TEXT PRIMARY KEY", quote_identifier(ID_COLUMN))];
    for column in &schema.columns {
        let mut def = format!(
            "{} {}",
            quote_identifier(&column.name),
            column.column_type.sql_type()
        );
        if column.required {
            def.push_str(" NOT NULL");
        }
        if column.unique {
            def.push_str(" UNIQUE");
        }
        columns.push(def);
    }
    columns.push(format!("{} TEXT NOT NULL", quote_identifier(CREATED_AT_COLUMN)));
    columns.push(format!("{} TEXT", quote_identifier(UPDATED_AT_COLUMN)));

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n);\n",
        quote_identifier(&schema.name),
        columns.join(",\n  ")
    );

    for index in &schema.indexes {
        let cols = index
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        ddl.push_str(&format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});\n",
            if index.unique { "UNIQUE " } else { "" },
            quote_identifier(&index.name),
            quote_identifier(&schema.name),
            cols
        ));
    }
    ddl
}

/// Map storage failures caused by the written data to caller-facing errors.
fn map_write_error(err: rusqlite::Error) -> NebulaError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => NebulaError::Conflict(err.to_string()),
        _ => NebulaError::Sqlite(err),
    }
}

fn is_internal_table(name: &str) -> bool {
    name.get(..INTERNAL_TABLE_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(INTERNAL_TABLE_PREFIX))
}

/// Prepare-time authorizer installed while tenant-authored SQL runs.
fn tenant_sql_authorizer(ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Attach { .. }
        | AuthAction::Detach { .. }
        | AuthAction::Pragma { .. }
        | AuthAction::CreateTrigger { .. }
        | AuthAction::CreateTempTrigger { .. } => Authorization::Deny,
        AuthAction::Function { function_name }
            if function_name.eq_ignore_ascii_case("load_extension") =>
        {
            Authorization::Deny
        }
        AuthAction::Read { table_name, .. }
        | AuthAction::Insert { table_name }
        | AuthAction::Update { table_name, .. }
        | AuthAction::Delete { table_name }
        | AuthAction::DropTable { table_name }
        | AuthAction::AlterTable { table_name, .. }
        | AuthAction::CreateIndex { table_name, .. }
            if is_internal_table(table_name) =>
        {
            Authorization::Deny
        }
        _ => Authorization::Allow,
    }
}

/// Errors from tenant-authored SQL are the caller's, not the server's.
fn map_sql_error(err: rusqlite::Error) -> NebulaError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => NebulaError::Conflict(err.to_string()),
        Some(rusqlite::ErrorCode::AuthorizationForStatementDenied) => {
            NebulaError::ValidationError("Statement is not permitted on tenant databases".to_string())
        }
        Some(rusqlite::ErrorCode::Unknown) | Some(rusqlite::ErrorCode::TypeMismatch) => {
            NebulaError::ValidationError(format!("Query failed: {}", err))
        }
        _ => NebulaError::Sqlite(err),
    }
}

fn run_statement(conn: &Connection, query: &str) -> Result<SqlOutcome> {
    let mut batch = Batch::new(conn, query);
    let mut stmt = batch
        .next()
        .map_err(map_sql_error)?
        .ok_or_else(|| NebulaError::ValidationError("Query cannot be empty".to_string()))?;
    if batch.next().map_err(map_sql_error)?.is_some() {
        return Err(NebulaError::ValidationError(
            "Only one statement may be executed per request".to_string(),
        ));
    }

    let column_count = stmt.column_count();

    if column_count == 0 {
        let affected = stmt.execute([]).map_err(map_sql_error)?;
        return Ok(SqlOutcome {
            row_count: affected,
            ..Default::default()
        });
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([]).map_err(map_sql_error)?;
    let mut out = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next().map_err(map_sql_error)? {
        if out.len() >= MAX_SQL_ROWS {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let value = FieldValue::from_sql(row.get_ref(idx)?, None)?;
            values.push(serde_json::to_value(value)?);
        }
        out.push(values);
    }

    Ok(SqlOutcome {
        columns,
        row_count: out.len(),
        rows: out,
        truncated,
    })
}

// =============================================================================
// Tenant Store
// =============================================================================

/// SQLite-backed [`TenantStore`] for one logical database.
pub struct SqliteTenantStore {
    database_id: String,
    slots: Arc<ConnectionSlots>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for SqliteTenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTenantStore")
            .field("database_id", &self.database_id)
            .field("path", &self.slots.path)
            .field("in_use", &self.in_use())
            .field("idle", &self.idle_connections())
            .finish()
    }
}

impl SqliteTenantStore {
    /// Create a store for `path`. No connection is opened until first use.
    pub fn new(
        database_id: impl Into<String>,
        path: impl Into<PathBuf>,
        credential_fingerprint: impl Into<String>,
        config: ConnectionPoolConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_open));
        Self {
            database_id: database_id.into(),
            slots: Arc::new(ConnectionSlots {
                path: path.into(),
                fingerprint: credential_fingerprint.into(),
                config,
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                opened_total: AtomicU64::new(0),
            }),
            permits,
        }
    }

    pub fn path(&self) -> &Path {
        &self.slots.path
    }

    /// Physical connections opened over the store's lifetime.
    pub fn opened_connections(&self) -> u64 {
        self.slots.opened_total.load(Ordering::Relaxed)
    }

    pub fn idle_connections(&self) -> usize {
        self.slots.idle.lock().len()
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.slots.config.max_open - self.permits.available_permits()
    }

    /// Run `op` on a pooled connection inside `spawn_blocking`.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        if self.slots.closed.load(Ordering::Acquire) {
            return Err(NebulaError::Unavailable(format!(
                "Tenant store '{}' is closed",
                self.database_id
            )));
        }

        let permit = match tokio::time::timeout(
            self.slots.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(NebulaError::Unavailable(format!(
                    "Tenant store '{}' is closed",
                    self.database_id
                )))
            }
            Err(_) => {
                return Err(NebulaError::Unavailable(format!(
                    "Timeout waiting for connection (database: {}, timeout: {}s)",
                    self.database_id,
                    self.slots.config.acquire_timeout.as_secs()
                )))
            }
        };

        let slots = Arc::clone(&self.slots);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut pooled = slots.checkout()?;
            let result = op(&mut pooled.conn);
            slots.checkin(pooled);
            result
        })
        .await
        .map_err(|e| NebulaError::Other(format!("Task join error: {}", e)))?
    }
}

impl TenantStore for SqliteTenantStore {
    fn database_id(&self) -> &str {
        &self.database_id
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.with_connection(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
        })
    }

    fn create_table<'a>(&'a self, schema: &'a TableSchema) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_table_schema(schema)?;
            let ddl = create_table_ddl(schema);
            let table = schema.name.clone();
            self.with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(&ddl).map_err(map_write_error)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
            info!(database_id = %self.database_id, table = %table, "Created tenant table");
            Ok(())
        })
    }

    fn drop_table<'a>(&'a self, table: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_table_name(table)?;
            let sql = format!("DROP TABLE IF EXISTS {}", quote_identifier(table));
            self.with_connection(move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await?;
            info!(database_id = %self.database_id, table = %table, "Dropped tenant table");
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        schema: &'a TableSchema,
        query: &'a ListQuery,
    ) -> StoreFuture<'a, Vec<Record>> {
        Box::pin(async move {
            let (sql, params) = build_list_sql(schema, query)?;
            if query.limit == 0 {
                return Ok(Vec::new());
            }
            let schema = schema.clone();
            self.with_connection(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(params_from_iter(params.iter()), |row| read_record(row, &schema))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
        })
    }

    fn get<'a>(&'a self, schema: &'a TableSchema, id: &'a str) -> StoreFuture<'a, Option<Record>> {
        Box::pin(async move {
            let schema = schema.clone();
            let id = id.to_string();
            self.with_connection(move |conn| fetch_by_id(conn, &schema, &id))
                .await
        })
    }

    fn insert<'a>(&'a self, schema: &'a TableSchema, record: Record) -> StoreFuture<'a, Record> {
        Box::pin(async move {
            ensure_known_columns(schema, &record)?;
            let id = record
                .id()
                .ok_or_else(|| NebulaError::ValidationError("Record is missing an id".to_string()))?
                .to_string();

            let (columns, values): (Vec<String>, Vec<FieldValue>) = record.into_iter().unzip();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_identifier(&schema.name),
                columns
                    .iter()
                    .map(|c| quote_identifier(c))
                    .collect::<Vec<_>>()
                    .join(", "),
                (1..=values.len())
                    .map(|i| format!("?{}", i))
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            let schema = schema.clone();
            self.with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(&sql, params_from_iter(values.iter()))
                    .map_err(map_write_error)?;
                let stored = fetch_by_id(&tx, &schema, &id)?.ok_or_else(|| {
                    NebulaError::Other(format!("Inserted record '{}' not readable", id))
                })?;
                tx.commit()?;
                Ok(stored)
            })
            .await
        })
    }

    fn update<'a>(
        &'a self,
        schema: &'a TableSchema,
        id: &'a str,
        patch: Record,
    ) -> StoreFuture<'a, Option<Record>> {
        Box::pin(async move {
            ensure_known_columns(schema, &patch)?;
            if patch.is_empty() {
                return Err(NebulaError::ValidationError(
                    "Update data cannot be empty".to_string(),
                ));
            }

            let (columns, mut values): (Vec<String>, Vec<FieldValue>) = patch.into_iter().unzip();
            let assignments = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote_identifier(c), i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let table = quote_identifier(&schema.name);
            let id_column = quote_identifier(ID_COLUMN);
            let update_sql = format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                table,
                assignments,
                id_column,
                values.len() + 1
            );
            let exists_sql = format!("SELECT 1 FROM {} WHERE {} = ?1", table, id_column);
            values.push(FieldValue::Text(id.to_string()));

            let schema = schema.clone();
            let id = id.to_string();
            self.with_connection(move |conn| {
                let tx = conn.transaction()?;
                let exists = tx
                    .query_row(&exists_sql, [&id], |row| row.get::<_, i64>(0))
                    .optional()?;
                if exists.is_none() {
                    return Ok(None);
                }
                tx.execute(&update_sql, params_from_iter(values.iter()))
                    .map_err(map_write_error)?;
                let stored = fetch_by_id(&tx, &schema, &id)?;
                tx.commit()?;
                Ok(stored)
            })
            .await
        })
    }

    fn delete<'a>(&'a self, schema: &'a TableSchema, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_identifier(&schema.name),
                quote_identifier(ID_COLUMN)
            );
            let id = id.to_string();
            self.with_connection(move |conn| {
                let affected = conn.execute(&sql, [&id]).map_err(map_write_error)?;
                Ok(affected > 0)
            })
            .await
        })
    }

    fn execute_sql<'a>(&'a self, query: &'a str) -> StoreFuture<'a, SqlOutcome> {
        Box::pin(async move {
            let query = query.to_string();
            self.with_connection(move |conn| {
                conn.authorizer(Some(tenant_sql_authorizer));
                let outcome = run_statement(conn, &query);
                conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
                outcome
            })
            .await
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if self.slots.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.permits.close();
            let drained = {
                let mut idle = self.slots.idle.lock();
                std::mem::take(&mut *idle)
            };
            let count = drained.len();
            if count > 0 {
                tokio::task::spawn_blocking(move || drop(drained))
                    .await
                    .map_err(|e| NebulaError::Other(format!("Task join error: {}", e)))?;
            }
            info!(
                database_id = %self.database_id,
                closed_idle = count,
                "Closed tenant store"
            );
            Ok(())
        })
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens [`SqliteTenantStore`]s from connection descriptors.
///
/// A database with a descriptor uses it (`sqlite://` prefix optional);
/// otherwise the default template applies. Either may contain
/// `{database_id}`:
/// - `/data/tenants/{database_id}.db`
/// - `sqlite:///var/lib/nebula/{database_id}/data.db`
#[derive(Debug)]
pub struct SqliteConnector {
    default_template: String,
    config: ConnectionPoolConfig,
}

impl SqliteConnector {
    /// # Errors
    ///
    /// Returns error if the template lacks `{database_id}` or the limits are invalid.
    pub fn new(default_template: impl Into<String>, config: ConnectionPoolConfig) -> Result<Self> {
        let template = default_template.into();
        if !template.contains(DATABASE_ID_PLACEHOLDER) {
            return Err(NebulaError::ValidationError(format!(
                "storage template must contain '{}' placeholder",
                DATABASE_ID_PLACEHOLDER
            )));
        }
        config.validate()?;
        Ok(Self {
            default_template: template,
            config,
        })
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    /// Resolve the file path for `database`.
    pub fn resolve_path(&self, database: &LogicalDatabase) -> Result<PathBuf> {
        let id = DatabaseId::new(database.id.as_str())?;
        let descriptor = database
            .connection_descriptor
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&self.default_template);

        let location = match descriptor.strip_prefix(SQLITE_SCHEME) {
            Some(rest) => rest,
            None if descriptor.contains("://") => {
                return Err(NebulaError::Unavailable(format!(
                    "Unsupported connection descriptor for database '{}'",
                    id
                )))
            }
            None => descriptor,
        };

        Ok(PathBuf::from(
            location.replace(DATABASE_ID_PLACEHOLDER, id.as_str()),
        ))
    }
}

impl StoreConnector for SqliteConnector {
    fn connect<'a>(
        &'a self,
        database: &'a LogicalDatabase,
        credential: &'a DerivedCredential,
    ) -> StoreFuture<'a, Arc<dyn TenantStore>> {
        Box::pin(async move {
            let path = self.resolve_path(database)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let parent = parent.to_path_buf();
                tokio::task::spawn_blocking(move || std::fs::create_dir_all(parent))
                    .await
                    .map_err(|e| NebulaError::Other(format!("Task join error: {}", e)))?
                    .map_err(|e| {
                        NebulaError::Unavailable(format!("Cannot prepare tenant storage: {}", e))
                    })?;
            }

            debug!(
                database_id = %database.id,
                user = %credential.user,
                path = %path.display(),
                "Connecting tenant store"
            );
            let store = SqliteTenantStore::new(
                database.id.clone(),
                path,
                credential.fingerprint(),
                self.config.clone(),
            );
            Ok(Arc::new(store) as Arc<dyn TenantStore>)
        })
    }
}
