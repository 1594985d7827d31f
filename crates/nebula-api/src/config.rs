//! Server configuration loaded from the environment.

use crate::api_keys::ApiKeyConfig;
use crate::rate_limiting::RateLimitConfig;
use crate::usage::UsageConfig;
use nebuladb_core::{NebulaError, Result};
use nebuladb_storage::sqlite::DATABASE_ID_PLACEHOLDER;
use nebuladb_storage::ConnectionPoolConfig;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_METADATA_DB: &str = "nebula_metadata.db";
const DEFAULT_TENANT_STORAGE_TEMPLATE: &str = "tenants/{database_id}.db";
const DEFAULT_CREDENTIAL_SECRET: &str = "nebula-dev-secret";

/// Top-level configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    pub metadata_db: PathBuf,
    /// Default connection descriptor; must contain `{database_id}`
    pub tenant_storage_template: String,
    /// Master secret for per-tenant derived credentials
    pub credential_secret: String,
    pub rate_limit: RateLimitConfig,
    pub pool: ConnectionPoolConfig,
    pub usage: UsageConfig,
    pub api_keys: ApiKeyConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            metadata_db: PathBuf::from(DEFAULT_METADATA_DB),
            tenant_storage_template: DEFAULT_TENANT_STORAGE_TEMPLATE.to_string(),
            credential_secret: DEFAULT_CREDENTIAL_SECRET.to_string(),
            rate_limit: RateLimitConfig::default(),
            pool: ConnectionPoolConfig::default(),
            usage: UsageConfig::default(),
            api_keys: ApiKeyConfig::default(),
        }
    }
}

impl ApiConfig {
    /// Load configuration from environment variables
    ///
    /// - `NEBULA_PORT` / `PORT`: listen port (default: 8080)
    /// - `NEBULA_METADATA_DB`: metadata SQLite path (default: nebula_metadata.db)
    /// - `NEBULA_TENANT_STORAGE_TEMPLATE`: tenant path template (default: tenants/{database_id}.db)
    /// - `NEBULA_CREDENTIAL_SECRET`: master secret for derived credentials
    ///
    /// Rate limit, pool, usage, and API key settings are read by their own `from_env`.
    pub fn from_env() -> Self {
        let port = std::env::var("NEBULA_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        Self {
            port,
            metadata_db: std::env::var("NEBULA_METADATA_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_METADATA_DB)),
            tenant_storage_template: std::env::var("NEBULA_TENANT_STORAGE_TEMPLATE")
                .unwrap_or_else(|_| DEFAULT_TENANT_STORAGE_TEMPLATE.to_string()),
            credential_secret: std::env::var("NEBULA_CREDENTIAL_SECRET").unwrap_or_else(|_| {
                tracing::warn!("NEBULA_CREDENTIAL_SECRET not set, using development secret");
                DEFAULT_CREDENTIAL_SECRET.to_string()
            }),
            rate_limit: RateLimitConfig::from_env(),
            pool: ConnectionPoolConfig::from_env(),
            usage: UsageConfig::from_env(),
            api_keys: ApiKeyConfig::from_env(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tenant_storage_template.contains(DATABASE_ID_PLACEHOLDER) {
            return Err(NebulaError::ValidationError(format!(
                "tenant storage template must contain {}",
                DATABASE_ID_PLACEHOLDER
            )));
        }
        if self.credential_secret.is_empty() {
            return Err(NebulaError::ValidationError(
                "credential secret cannot be empty".to_string(),
            ));
        }
        self.rate_limit.validate()?;
        self.pool.validate()?;
        self.usage.validate()?;
        self.api_keys.validate()?;
        Ok(())
    }
}
