//! Metadata store and the collaborator traits the data API depends on.
//!
//! The metadata store owns projects, memberships, logical databases, table
//! schemas, and the usage log. The API server only sees it through the narrow
//! traits below so each concern can be swapped or faked independently.
//!
//! Every call opens a short-lived connection inside `spawn_blocking` and
//! issues parameterized statements only.

use crate::tenant::DatabaseId;
use async_trait::async_trait;
use nebuladb_core::validation::validate_table_schema;
use nebuladb_core::{
    format_timestamp, init_metadata_schema, now_timestamp, parse_timestamp, DatabaseStatus,
    LogicalDatabase, NebulaError, Project, Result, StoredTable, TableSchema, UsageEvent,
    UsageEventType, UsagePeriod, UsageSummary,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Looks up logical databases for the connection pool.
#[async_trait]
pub trait DatabaseDirectory: Send + Sync {
    async fn lookup_database(&self, database_id: &str) -> Result<Option<LogicalDatabase>>;
}

/// Ownership and membership checks.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Whether `user_id` may use `database_id` (owner or member of its project).
    async fn has_access(&self, user_id: &str, database_id: &str) -> Result<bool>;

    /// Whether `user_id` owns `project_id`.
    async fn is_owner(&self, user_id: &str, project_id: &str) -> Result<bool>;
}

/// Source of stored table schemas.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn find_table(&self, database_id: &str, table: &str) -> Result<Option<TableSchema>>;
}

/// Destination for drained usage events.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Persist a batch, returning the number written.
    async fn record_batch(&self, events: &[UsageEvent]) -> Result<usize>;
}

// =============================================================================
// Metadata Store
// =============================================================================

/// Parameters for registering a logical database.
#[derive(Debug, Clone)]
pub struct NewDatabase {
    /// Explicit identifier; generated when `None`.
    pub id: Option<String>,
    pub project_id: String,
    pub name: String,
    pub connection_descriptor: Option<String>,
    pub status: DatabaseStatus,
}

/// SQLite-backed metadata store.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    db_path: PathBuf,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DATABASE_COLUMNS: &str =
    "id, project_id, name, connection_descriptor, status, created_at, updated_at";

const TABLE_COLUMNS: &str =
    "id, database_id, name, columns, indexes, api_enabled, created_at, updated_at";

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

fn conversion_error(idx: usize, err: NebulaError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn database_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogicalDatabase> {
    let status: String = row.get(4)?;
    Ok(LogicalDatabase {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        connection_descriptor: row.get(3)?,
        status: status.parse().map_err(|e| conversion_error(4, e))?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?),
        updated_at: parse_timestamp(&row.get::<_, String>(6)?),
    })
}

fn table_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredTable> {
    let columns: String = row.get(3)?;
    let indexes: String = row.get(4)?;
    Ok(StoredTable {
        id: row.get(0)?,
        database_id: row.get(1)?,
        schema: TableSchema {
            name: row.get(2)?,
            columns: serde_json::from_str(&columns).map_err(|e| conversion_error(3, e.into()))?,
            indexes: serde_json::from_str(&indexes).map_err(|e| conversion_error(4, e.into()))?,
            api_enabled: row.get(5)?,
        },
        created_at: parse_timestamp(&row.get::<_, String>(6)?),
        updated_at: parse_timestamp(&row.get::<_, String>(7)?),
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

fn query_database(conn: &Connection, database_id: &str) -> Result<Option<LogicalDatabase>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM databases WHERE id = ?1", DATABASE_COLUMNS),
            [database_id],
            database_from_row,
        )
        .optional()?)
}

impl MetadataStore {
    /// Open the metadata store at `path`, creating the schema if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                NebulaError::Other(format!("Cannot create metadata directory: {}", e))
            })?;
        }
        let conn = open_connection(&db_path)?;
        init_metadata_schema(&conn)?;
        info!(path = %db_path.display(), "Opened metadata store");
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| NebulaError::Other(format!("Task join error: {}", e)))?
    }

    /// Connectivity check for readiness probes.
    pub async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Projects
    // -------------------------------------------------------------------------

    pub async fn create_project(&self, name: &str, owner_id: &str) -> Result<Project> {
        if name.trim().is_empty() || owner_id.trim().is_empty() {
            return Err(NebulaError::ValidationError(
                "Project name and owner are required".to_string(),
            ));
        }
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            created_at: chrono::Utc::now(),
        };
        let row = project.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name, owner_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![row.id, row.name, row.owner_id, format_timestamp(&row.created_at)],
            )?;
            Ok(())
        })
        .await?;
        info!(project_id = %project.id, owner_id = %project.owner_id, "Created project");
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let project_id = project_id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, owner_id, created_at FROM projects WHERE id = ?1",
                    [&project_id],
                    |row| {
                        Ok(Project {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            owner_id: row.get(2)?,
                            created_at: parse_timestamp(&row.get::<_, String>(3)?),
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    /// Grant `user_id` access to a project, replacing any previous role.
    pub async fn add_member(&self, project_id: &str, user_id: &str, role: &str) -> Result<()> {
        let (project_id, user_id, role) =
            (project_id.to_string(), user_id.to_string(), role.to_string());
        self.run(move |conn| {
            let exists = conn
                .query_row("SELECT 1 FROM projects WHERE id = ?1", [&project_id], |_| Ok(()))
                .optional()?;
            if exists.is_none() {
                return Err(NebulaError::NotFound(format!(
                    "Project '{}' not found",
                    project_id
                )));
            }
            conn.execute(
                "INSERT INTO project_members (project_id, user_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (project_id, user_id) DO UPDATE SET role = excluded.role",
                params![project_id, user_id, role, now_timestamp()],
            )?;
            info!(project_id = %project_id, user_id = %user_id, role = %role, "Added project member");
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Databases
    // -------------------------------------------------------------------------

    pub async fn create_database(&self, new: NewDatabase) -> Result<LogicalDatabase> {
        let id = match new.id {
            Some(id) => DatabaseId::new(id)?,
            None => DatabaseId::new(format!("db-{}", uuid::Uuid::new_v4().simple()))?,
        };
        if new.name.trim().is_empty() {
            return Err(NebulaError::ValidationError(
                "Database name is required".to_string(),
            ));
        }

        let now = chrono::Utc::now();
        let database = LogicalDatabase {
            id: id.into_string(),
            project_id: new.project_id,
            name: new.name,
            connection_descriptor: new.connection_descriptor,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        let row = database.clone();
        self.run(move |conn| {
            let project = conn
                .query_row("SELECT 1 FROM projects WHERE id = ?1", [&row.project_id], |_| Ok(()))
                .optional()?;
            if project.is_none() {
                return Err(NebulaError::NotFound(format!(
                    "Project '{}' not found",
                    row.project_id
                )));
            }
            conn.execute(
                &format!(
                    "INSERT INTO databases ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    DATABASE_COLUMNS
                ),
                params![
                    row.id,
                    row.project_id,
                    row.name,
                    row.connection_descriptor,
                    row.status.as_str(),
                    format_timestamp(&row.created_at),
                    format_timestamp(&row.updated_at),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    NebulaError::Conflict(format!("Database '{}' already exists", row.id))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
        .await?;

        info!(
            database_id = %database.id,
            project_id = %database.project_id,
            status = %database.status,
            "Created logical database"
        );
        Ok(database)
    }

    pub async fn get_database(&self, database_id: &str) -> Result<Option<LogicalDatabase>> {
        let database_id = database_id.to_string();
        self.run(move |conn| query_database(conn, &database_id))
            .await
    }

    pub async fn list_databases(&self, project_id: &str) -> Result<Vec<LogicalDatabase>> {
        let project_id = project_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM databases WHERE project_id = ?1 ORDER BY created_at, id",
                DATABASE_COLUMNS
            ))?;
            let databases = stmt
                .query_map([&project_id], database_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(databases)
        })
        .await
    }

    /// Update a database's lifecycle status.
    pub async fn set_database_status(
        &self,
        database_id: &str,
        status: DatabaseStatus,
    ) -> Result<LogicalDatabase> {
        let database_id = database_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE databases SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_timestamp(), database_id],
            )?;
            if updated == 0 {
                return Err(NebulaError::NotFound(format!(
                    "Database '{}' not found",
                    database_id
                )));
            }
            query_database(conn, &database_id)?.ok_or_else(|| {
                NebulaError::NotFound(format!("Database '{}' not found", database_id))
            })
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Tables
    // -------------------------------------------------------------------------

    /// Store a table schema. Fails with `Conflict` if the name is taken.
    pub async fn register_table(&self, database_id: &str, schema: &TableSchema) -> Result<StoredTable> {
        validate_table_schema(schema)?;

        let now = chrono::Utc::now();
        let table = StoredTable {
            id: uuid::Uuid::new_v4().to_string(),
            database_id: database_id.to_string(),
            schema: schema.clone(),
            created_at: now,
            updated_at: now,
        };
        let columns = serde_json::to_string(&schema.columns)?;
        let indexes = serde_json::to_string(&schema.indexes)?;
        let row = table.clone();

        self.run(move |conn| {
            if query_database(conn, &row.database_id)?.is_none() {
                return Err(NebulaError::NotFound("Database not found".to_string()));
            }
            conn.execute(
                &format!(
                    "INSERT INTO user_tables ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    TABLE_COLUMNS
                ),
                params![
                    row.id,
                    row.database_id,
                    row.schema.name,
                    columns,
                    indexes,
                    row.schema.api_enabled,
                    format_timestamp(&row.created_at),
                    format_timestamp(&row.updated_at),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    NebulaError::Conflict(format!("Table '{}' already exists", row.schema.name))
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })
        .await?;

        info!(database_id = %table.database_id, table = %table.schema.name, "Registered table schema");
        Ok(table)
    }

    pub async fn get_table(&self, database_id: &str, name: &str) -> Result<Option<StoredTable>> {
        let (database_id, name) = (database_id.to_string(), name.to_string());
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM user_tables WHERE database_id = ?1 AND name = ?2",
                        TABLE_COLUMNS
                    ),
                    [&database_id, &name],
                    table_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn list_tables(&self, database_id: &str) -> Result<Vec<StoredTable>> {
        let database_id = database_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM user_tables WHERE database_id = ?1 ORDER BY name",
                TABLE_COLUMNS
            ))?;
            let tables = stmt
                .query_map([&database_id], table_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tables)
        })
        .await
    }

    /// Remove a table schema, reporting whether one existed.
    pub async fn delete_table(&self, database_id: &str, name: &str) -> Result<bool> {
        let (database_id, name) = (database_id.to_string(), name.to_string());
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM user_tables WHERE database_id = ?1 AND name = ?2",
                [&database_id, &name],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Usage
    // -------------------------------------------------------------------------

    /// Append usage events in one transaction.
    pub async fn insert_usage_events(&self, events: Vec<UsageEvent>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO usage_logs (project_id, database_id, event_type, details, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for event in &events {
                    stmt.execute(params![
                        event.project_id,
                        event.database_id,
                        event.event_type.as_str(),
                        serde_json::to_string(&event.details)?,
                        format_timestamp(&event.created_at),
                    ])?;
                }
            }
            tx.commit()?;
            debug!(count = events.len(), "Wrote usage events");
            Ok(events.len())
        })
        .await
    }

    /// Aggregate a project's usage over `period`.
    pub async fn usage_summary(&self, project_id: &str, period: UsagePeriod) -> Result<UsageSummary> {
        let project_id = project_id.to_string();
        let since = format_timestamp(&(chrono::Utc::now() - period.duration()));
        self.run(move |conn| {
            let (api_calls, queries, errors, avg_duration): (i64, i64, i64, Option<f64>) = conn
                .query_row(
                    "SELECT
                       COALESCE(SUM(CASE WHEN event_type = ?3 THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN event_type = ?4 THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN event_type = ?3
                         AND CAST(json_extract(details, '$.status_code') AS INTEGER) >= 400
                         THEN 1 ELSE 0 END), 0),
                       AVG(CASE WHEN event_type = ?3
                         THEN json_extract(details, '$.duration_ms') END)
                     FROM usage_logs
                     WHERE project_id = ?1 AND created_at >= ?2",
                    params![
                        project_id,
                        since,
                        UsageEventType::ApiCall.as_str(),
                        UsageEventType::Query.as_str(),
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;

            let error_rate = if api_calls > 0 {
                errors as f64 / api_calls as f64 * 100.0
            } else {
                0.0
            };

            Ok(UsageSummary {
                project_id,
                period: period.as_str().to_string(),
                api_calls,
                queries,
                errors,
                error_rate,
                avg_duration_ms: avg_duration.unwrap_or(0.0),
            })
        })
        .await
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

#[async_trait]
impl DatabaseDirectory for MetadataStore {
    async fn lookup_database(&self, database_id: &str) -> Result<Option<LogicalDatabase>> {
        self.get_database(database_id).await
    }
}

#[async_trait]
impl AccessControl for MetadataStore {
    async fn has_access(&self, user_id: &str, database_id: &str) -> Result<bool> {
        let (user_id, database_id) = (user_id.to_string(), database_id.to_string());
        self.run(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1
                     FROM databases d
                     JOIN projects p ON p.id = d.project_id
                     LEFT JOIN project_members m
                       ON m.project_id = p.id AND m.user_id = ?1
                     WHERE d.id = ?2
                       AND d.status != 'deleted'
                       AND (p.owner_id = ?1 OR m.user_id IS NOT NULL)",
                    [&user_id, &database_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn is_owner(&self, user_id: &str, project_id: &str) -> Result<bool> {
        let (user_id, project_id) = (user_id.to_string(), project_id.to_string());
        self.run(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM projects WHERE id = ?1 AND owner_id = ?2",
                    [&project_id, &user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

#[async_trait]
impl SchemaSource for MetadataStore {
    async fn find_table(&self, database_id: &str, table: &str) -> Result<Option<TableSchema>> {
        Ok(self
            .get_table(database_id, table)
            .await?
            .map(|stored| stored.schema))
    }
}

#[async_trait]
impl UsageSink for MetadataStore {
    async fn record_batch(&self, events: &[UsageEvent]) -> Result<usize> {
        self.insert_usage_events(events.to_vec()).await
    }
}
