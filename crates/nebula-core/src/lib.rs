//! NebulaDB Core
//!
//! Core types, errors, and the metadata SQLite schema shared by the NebulaDB
//! storage layer, API server, and admin CLI.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod record;
pub mod validation;

pub use record::{FieldValue, Record};

/// Server-managed primary key column present on every tenant table
pub const ID_COLUMN: &str = "id";

/// Server-managed creation timestamp column
pub const CREATED_AT_COLUMN: &str = "created_at";

/// Server-managed last-update timestamp column
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Columns that the data API manages itself and callers may not write
pub const SYSTEM_COLUMNS: [&str; 3] = [ID_COLUMN, CREATED_AT_COLUMN, UPDATED_AT_COLUMN];

// ============================================================================
// Logical Databases
// ============================================================================

/// Lifecycle status of a logical database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    /// Storage is being prepared; not yet reachable
    Provisioning,
    /// Serving traffic
    Active,
    /// Temporarily blocked (billing, abuse)
    Suspended,
    /// Soft-deleted; treated as nonexistent
    Deleted,
}

impl DatabaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseStatus::Provisioning => "provisioning",
            DatabaseStatus::Active => "active",
            DatabaseStatus::Suspended => "suspended",
            DatabaseStatus::Deleted => "deleted",
        }
    }

    /// Whether connections may be opened against a database in this state.
    pub fn is_operational(&self) -> bool {
        matches!(self, DatabaseStatus::Active)
    }
}

impl std::fmt::Display for DatabaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatabaseStatus {
    type Err = NebulaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provisioning" => Ok(DatabaseStatus::Provisioning),
            "active" => Ok(DatabaseStatus::Active),
            "suspended" => Ok(DatabaseStatus::Suspended),
            "deleted" => Ok(DatabaseStatus::Deleted),
            _ => Err(NebulaError::ValidationError(format!(
                "Unknown database status: {}",
                s
            ))),
        }
    }
}

/// A tenant (project) that owns logical databases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Principal that owns the project
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// A tenant-owned logical database registered in the metadata store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalDatabase {
    /// Unique database identifier (also the pool key)
    pub id: String,
    /// Owning project
    pub project_id: String,
    /// Human-readable name
    pub name: String,
    /// Where the physical store lives. `None` means the server's default template applies.
    pub connection_descriptor: Option<String>,
    /// Lifecycle status
    pub status: DatabaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Table Schemas
// ============================================================================

/// Declared type of a tenant table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    /// RFC 3339 timestamp, stored as text
    Timestamp,
    /// Arbitrary JSON document, stored as serialized text
    Json,
    /// Hyphenated UUID, stored as text
    Uuid,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
            ColumnType::Uuid => "uuid",
        }
    }

    /// SQLite storage type used when the physical table is created.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::Text | ColumnType::Timestamp | ColumnType::Json | ColumnType::Uuid => {
                "TEXT"
            }
        }
    }

    /// Whether free-text list filters match against this column.
    pub fn is_searchable(&self) -> bool {
        matches!(self, ColumnType::Text | ColumnType::Uuid)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ColumnType {
    type Err = NebulaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "float" | "real" | "double" | "numeric" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "timestamp" | "datetime" | "timestamptz" => Ok(ColumnType::Timestamp),
            "json" | "jsonb" => Ok(ColumnType::Json),
            "uuid" => Ok(ColumnType::Uuid),
            _ => Err(NebulaError::ValidationError(format!(
                "Unknown column type: {}",
                s
            ))),
        }
    }
}

/// Column definition within a table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Required columns must be present and non-null on create
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
}

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Stored definition of a tenant table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// User columns in declaration order (system columns are implicit)
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Whether the generated CRUD surface serves this table
    #[serde(default = "default_api_enabled")]
    pub api_enabled: bool,
}

fn default_api_enabled() -> bool {
    true
}

impl TableSchema {
    /// Look up a user column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Declared type of any column, including the system columns.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        match name {
            ID_COLUMN => Some(ColumnType::Uuid),
            CREATED_AT_COLUMN | UPDATED_AT_COLUMN => Some(ColumnType::Timestamp),
            _ => self.column(name).map(|c| c.column_type),
        }
    }

    /// Whether `name` is a valid sort key (user or system column).
    pub fn is_sortable(&self, name: &str) -> bool {
        self.column_type(name).is_some()
    }

    /// All column names in result order: `id`, user columns, then timestamps.
    pub fn all_columns(&self) -> Vec<&str> {
        let mut names = Vec::with_capacity(self.columns.len() + SYSTEM_COLUMNS.len());
        names.push(ID_COLUMN);
        names.extend(self.columns.iter().map(|c| c.name.as_str()));
        names.push(CREATED_AT_COLUMN);
        names.push(UPDATED_AT_COLUMN);
        names
    }

    /// Columns the free-text list filter matches against.
    pub fn searchable_columns(&self) -> Vec<&str> {
        let mut names = vec![ID_COLUMN];
        names.extend(
            self.columns
                .iter()
                .filter(|c| c.column_type.is_searchable())
                .map(|c| c.name.as_str()),
        );
        names
    }
}

/// A table schema as registered in the metadata store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTable {
    pub id: String,
    pub database_id: String,
    #[serde(flatten)]
    pub schema: TableSchema,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Usage Events
// ============================================================================

/// Kind of metered usage event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    /// A call to the generated data API
    ApiCall,
    /// A direct SQL execution
    Query,
}

impl UsageEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEventType::ApiCall => "api_call",
            UsageEventType::Query => "query",
        }
    }
}

impl std::fmt::Display for UsageEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only usage record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Owning project; `None` when the database could not be resolved
    pub project_id: Option<String>,
    pub database_id: Option<String>,
    pub event_type: UsageEventType,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        project_id: Option<String>,
        database_id: Option<String>,
        event_type: UsageEventType,
        details: serde_json::Value,
    ) -> Self {
        Self {
            project_id,
            database_id,
            event_type,
            details,
            created_at: Utc::now(),
        }
    }
}

/// Reporting window for usage summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsagePeriod {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl UsagePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsagePeriod::Hour => "1h",
            UsagePeriod::Day => "24h",
            UsagePeriod::Week => "7d",
            UsagePeriod::Month => "30d",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            UsagePeriod::Hour => chrono::Duration::hours(1),
            UsagePeriod::Day => chrono::Duration::hours(24),
            UsagePeriod::Week => chrono::Duration::days(7),
            UsagePeriod::Month => chrono::Duration::days(30),
        }
    }
}

impl std::str::FromStr for UsagePeriod {
    type Err = NebulaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1h" => Ok(UsagePeriod::Hour),
            "24h" | "1d" => Ok(UsagePeriod::Day),
            "7d" => Ok(UsagePeriod::Week),
            "30d" => Ok(UsagePeriod::Month),
            _ => Err(NebulaError::ValidationError(format!(
                "Unknown usage period '{}' (expected 1h, 24h, 7d, or 30d)",
                s
            ))),
        }
    }
}

/// Aggregated usage over a reporting period
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSummary {
    pub project_id: String,
    pub period: String,
    pub api_calls: i64,
    pub queries: i64,
    pub errors: i64,
    /// Percentage of api calls that ended with status >= 400
    pub error_rate: f64,
    pub avg_duration_ms: f64,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur in NebulaDB operations
#[derive(Debug, thiserror::Error)]
pub enum NebulaError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimited {
        limit: u32,
        window_secs: u64,
        retry_after_secs: u64,
    },

    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for NebulaError {
    fn from(err: serde_json::Error) -> Self {
        NebulaError::SerializationError(err.to_string())
    }
}

/// Result type for NebulaDB operations
pub type Result<T> = std::result::Result<T, NebulaError>;

/// Current time in the text form stored in every SQLite timestamp column.
///
/// Fixed-width millisecond RFC 3339 so that lexical order equals time order.
pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, falling back to the epoch for malformed rows.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

// ============================================================================
// Metadata Schema
// ============================================================================

/// Initialize the metadata store schema
///
/// Creates all necessary tables if they don't exist:
/// - `projects`: Tenants
/// - `project_members`: Non-owner principals with access to a project
/// - `databases`: Logical databases and their lifecycle status
/// - `user_tables`: Tenant table schemas served by the data API
/// - `usage_logs`: Append-only usage events
/// - `api_keys`: Hashed API keys bound to principals
pub fn init_metadata_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    CREATE TABLE IF NOT EXISTS projects (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      owner_id TEXT NOT NULL,
      created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id);

    CREATE TABLE IF NOT EXISTS project_members (
      project_id TEXT NOT NULL,
      user_id TEXT NOT NULL,
      role TEXT NOT NULL DEFAULT 'member',
      created_at TEXT NOT NULL,
      PRIMARY KEY (project_id, user_id),
      FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS databases (
      id TEXT PRIMARY KEY,
      project_id TEXT NOT NULL,
      name TEXT NOT NULL,
      connection_descriptor TEXT,
      status TEXT NOT NULL DEFAULT 'provisioning',
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_databases_project ON databases(project_id);

    CREATE TABLE IF NOT EXISTS user_tables (
      id TEXT PRIMARY KEY,
      database_id TEXT NOT NULL,
      name TEXT NOT NULL,
      columns TEXT NOT NULL,
      indexes TEXT NOT NULL DEFAULT '[]',
      api_enabled INTEGER NOT NULL DEFAULT 1,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      UNIQUE (database_id, name),
      FOREIGN KEY (database_id) REFERENCES databases(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS usage_logs (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      project_id TEXT,
      database_id TEXT,
      event_type TEXT NOT NULL,
      details TEXT NOT NULL,
      created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_usage_logs_project_created
      ON usage_logs(project_id, created_at);

    CREATE TABLE IF NOT EXISTS api_keys (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      key_hash TEXT NOT NULL UNIQUE,
      name TEXT NOT NULL,
      user_id TEXT NOT NULL,
      created_at TEXT NOT NULL,
      revoked_at TEXT,
      last_used_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_api_keys_active ON api_keys(revoked_at);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> TableSchema {
        TableSchema {
            name: "users".to_string(),
            columns: vec![
                ColumnDef {
                    name: "name".to_string(),
                    column_type: ColumnType::Text,
                    required: true,
                    unique: false,
                },
                ColumnDef {
                    name: "age".to_string(),
                    column_type: ColumnType::Integer,
                    required: false,
                    unique: false,
                },
            ],
            indexes: vec![],
            api_enabled: true,
        }
    }

    #[test]
    fn test_init_metadata_schema_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        init_metadata_schema(&conn).unwrap();
        init_metadata_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        for expected in [
            "api_keys",
            "databases",
            "project_members",
            "projects",
            "usage_logs",
            "user_tables",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_database_status_round_trip() {
        for status in [
            DatabaseStatus::Provisioning,
            DatabaseStatus::Active,
            DatabaseStatus::Suspended,
            DatabaseStatus::Deleted,
        ] {
            let parsed: DatabaseStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("archived".parse::<DatabaseStatus>().is_err());
        assert!(DatabaseStatus::Active.is_operational());
        assert!(!DatabaseStatus::Suspended.is_operational());
    }

    #[test]
    fn test_column_type_aliases() {
        assert_eq!("VARCHAR".parse::<ColumnType>().unwrap(), ColumnType::Text);
        assert_eq!("bigint".parse::<ColumnType>().unwrap(), ColumnType::Integer);
        assert_eq!("jsonb".parse::<ColumnType>().unwrap(), ColumnType::Json);
        assert!("blob".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_schema_column_lookup() {
        let schema = users_schema();
        assert_eq!(schema.column_type("name"), Some(ColumnType::Text));
        assert_eq!(schema.column_type("id"), Some(ColumnType::Uuid));
        assert_eq!(schema.column_type("created_at"), Some(ColumnType::Timestamp));
        assert_eq!(schema.column_type("missing"), None);
        assert!(schema.is_sortable("age"));
        assert!(!schema.is_sortable("age; DROP TABLE users"));
        assert_eq!(
            schema.all_columns(),
            vec!["id", "name", "age", "created_at", "updated_at"]
        );
        assert_eq!(schema.searchable_columns(), vec!["id", "name"]);
    }

    #[test]
    fn test_table_schema_deserialize_defaults() {
        let schema: TableSchema = serde_json::from_value(serde_json::json!({
            "name": "users",
            "columns": [{"name": "email", "type": "text"}]
        }))
        .unwrap();
        assert!(schema.api_enabled);
        assert!(schema.indexes.is_empty());
        assert!(!schema.columns[0].required);
    }

    #[test]
    fn test_usage_period_parse() {
        assert_eq!("7d".parse::<UsagePeriod>().unwrap(), UsagePeriod::Week);
        assert_eq!(UsagePeriod::default().as_str(), "24h");
        assert_eq!(UsagePeriod::Hour.duration(), chrono::Duration::hours(1));
        assert!("2w".parse::<UsagePeriod>().is_err());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = parse_timestamp("2024-01-01T00:00:00.000Z");
        let later = parse_timestamp("2024-01-01T00:00:01.000Z");
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        assert_eq!(parse_timestamp("garbage"), DateTime::<Utc>::default());
    }
}
