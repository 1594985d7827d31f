//! NebulaDB Admin CLI
//!
//! Bootstraps and inspects the metadata store used by the data API server.

use clap::{Parser, Subcommand};
use nebuladb_api::api_keys::{ApiKeyConfig, ApiKeyManager};
use nebuladb_core::{DatabaseStatus, UsagePeriod};
use nebuladb_storage::{MetadataStore, NewDatabase};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "nebula")]
#[command(version, about = "NebulaDB admin CLI", long_about = None)]
struct Cli {
    /// Path to the metadata database
    #[arg(
        short,
        long,
        env = "NEBULA_METADATA_DB",
        default_value = "nebula_metadata.db",
        global = true
    )]
    metadata_db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the metadata schema
    Init,

    /// Create a project owned by a principal
    CreateProject {
        #[arg(short, long)]
        name: String,

        /// User id of the owner
        #[arg(short, long)]
        owner: String,
    },

    /// Grant a principal access to a project
    AddMember {
        #[arg(short, long)]
        project: String,

        #[arg(short, long)]
        user: String,

        #[arg(short, long, default_value = "member")]
        role: String,
    },

    /// Register a logical database
    CreateDatabase {
        #[arg(short, long)]
        project: String,

        #[arg(short, long)]
        name: String,

        /// Database id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Storage location; the server's template applies when omitted
        #[arg(long)]
        descriptor: Option<String>,

        /// Initial status
        #[arg(long, default_value = "active")]
        status: String,
    },

    /// List a project's databases
    ListDatabases {
        #[arg(short, long)]
        project: String,
    },

    /// Change a database's lifecycle status
    ///
    /// A running server picks this up on the next pool miss. Use the
    /// `PUT /api/v1/databases/{id}/status` endpoint to also close open connections.
    SetStatus { database_id: String, status: String },

    /// Create an API key and print it once
    CreateKey {
        #[arg(short, long)]
        name: String,

        /// User id the key authenticates as
        #[arg(short, long)]
        user: String,
    },

    /// List API keys
    ListKeys,

    /// Revoke an API key by id
    RevokeKey { id: i64 },

    /// List tables registered for a database
    ListTables { database_id: String },

    /// Summarize a project's usage
    Usage {
        #[arg(short, long)]
        project: String,

        /// 1h, 24h, 7d, or 30d
        #[arg(long, default_value = "24h")]
        period: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.metadata_db.as_str();

    let result = match cli.command {
        Commands::Init => init(path),
        Commands::CreateProject { name, owner } => create_project(path, &name, &owner).await,
        Commands::AddMember {
            project,
            user,
            role,
        } => add_member(path, &project, &user, &role).await,
        Commands::CreateDatabase {
            project,
            name,
            id,
            descriptor,
            status,
        } => create_database(path, project, name, id, descriptor, &status).await,
        Commands::ListDatabases { project } => list_databases(path, &project).await,
        Commands::SetStatus {
            database_id,
            status,
        } => set_status(path, &database_id, &status).await,
        Commands::CreateKey { name, user } => create_key(path, &name, &user).await,
        Commands::ListKeys => list_keys(path).await,
        Commands::RevokeKey { id } => revoke_key(path, id).await,
        Commands::ListTables { database_id } => list_tables(path, &database_id).await,
        Commands::Usage { project, period } => usage(path, &project, &period).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init(path: &str) -> CliResult {
    MetadataStore::open(path)?;
    println!("Initialized metadata store at '{}'", path);
    Ok(())
}

async fn create_project(path: &str, name: &str, owner: &str) -> CliResult {
    let store = MetadataStore::open(path)?;
    let project = store.create_project(name, owner).await?;
    println!("Created project '{}' ({})", project.name, project.id);
    Ok(())
}

async fn add_member(path: &str, project: &str, user: &str, role: &str) -> CliResult {
    let store = MetadataStore::open(path)?;
    store.add_member(project, user, role).await?;
    println!("Added '{}' to project {} as {}", user, project, role);
    Ok(())
}

async fn create_database(
    path: &str,
    project_id: String,
    name: String,
    id: Option<String>,
    connection_descriptor: Option<String>,
    status: &str,
) -> CliResult {
    let status: DatabaseStatus = status.parse()?;
    let store = MetadataStore::open(path)?;
    let database = store
        .create_database(NewDatabase {
            id,
            project_id,
            name,
            connection_descriptor,
            status,
        })
        .await?;
    println!(
        "Created database '{}' ({}) with status {}",
        database.name, database.id, database.status
    );
    Ok(())
}

async fn list_databases(path: &str, project: &str) -> CliResult {
    let store = MetadataStore::open(path)?;
    let databases = store.list_databases(project).await?;
    if databases.is_empty() {
        println!("No databases found.");
        return Ok(());
    }

    println!("{:<40} {:<20} {:<12}", "ID", "NAME", "STATUS");
    println!("{}", "-".repeat(74));
    for database in databases {
        println!(
            "{:<40} {:<20} {:<12}",
            database.id, database.name, database.status
        );
    }
    Ok(())
}

async fn set_status(path: &str, database_id: &str, status: &str) -> CliResult {
    let status: DatabaseStatus = status.parse()?;
    let store = MetadataStore::open(path)?;
    let database = store.set_database_status(database_id, status).await?;
    println!("Database {} is now {}", database.id, database.status);
    Ok(())
}

/// Key storage lives in the metadata database; opening the store first creates the schema.
fn key_manager(path: &str) -> Result<ApiKeyManager, Box<dyn std::error::Error>> {
    MetadataStore::open(path)?;
    Ok(ApiKeyManager::new(path, ApiKeyConfig::from_env())?)
}

async fn create_key(path: &str, name: &str, user: &str) -> CliResult {
    let manager = key_manager(path)?;
    let key = manager.create_key(name, user).await?;
    println!("Created API key '{}' for {}", name, user);
    println!();
    println!("  {}", key);
    println!();
    println!("Store it now; it cannot be shown again.");
    Ok(())
}

async fn list_keys(path: &str) -> CliResult {
    let manager = key_manager(path)?;
    let keys = manager.list_keys().await?;
    if keys.is_empty() {
        println!("No API keys found.");
        return Ok(());
    }

    println!(
        "{:<6} {:<20} {:<20} {:<26} {:<8}",
        "ID", "NAME", "USER", "LAST USED", "REVOKED"
    );
    println!("{}", "-".repeat(84));
    for key in keys {
        println!(
            "{:<6} {:<20} {:<20} {:<26} {:<8}",
            key.id,
            key.name,
            key.user_id,
            key.last_used_at.as_deref().unwrap_or("never"),
            if key.revoked_at.is_some() { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn revoke_key(path: &str, id: i64) -> CliResult {
    let manager = key_manager(path)?;
    if manager.revoke_key(id).await? {
        println!("Revoked API key {}", id);
        Ok(())
    } else {
        Err(format!("API key {} not found or already revoked", id).into())
    }
}

async fn list_tables(path: &str, database_id: &str) -> CliResult {
    let store = MetadataStore::open(path)?;
    let tables = store.list_tables(database_id).await?;
    if tables.is_empty() {
        println!("No tables found.");
        return Ok(());
    }

    for table in tables {
        let columns: Vec<String> = table
            .schema
            .columns
            .iter()
            .map(|c| {
                let mut desc = format!("{} {}", c.name, c.column_type);
                if c.required {
                    desc.push_str(" required");
                }
                if c.unique {
                    desc.push_str(" unique");
                }
                desc
            })
            .collect();
        println!(
            "{}{}",
            table.schema.name,
            if table.schema.api_enabled { "" } else { " (api disabled)" }
        );
        for column in columns {
            println!("  {}", column);
        }
    }
    Ok(())
}

async fn usage(path: &str, project: &str, period: &str) -> CliResult {
    let period: UsagePeriod = period.parse()?;
    let store = MetadataStore::open(path)?;
    let summary = store.usage_summary(project, period).await?;

    println!("Usage for project {} over {}", summary.project_id, summary.period);
    println!("  API calls:    {}", summary.api_calls);
    println!("  Queries:      {}", summary.queries);
    println!("  Errors:       {}", summary.errors);
    println!("  Error rate:   {:.2}%", summary.error_rate);
    println!("  Avg duration: {:.1} ms", summary.avg_duration_ms);
    Ok(())
}
