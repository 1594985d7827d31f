//! Shared application state.

use crate::api_keys::ApiKeyManager;
use crate::config::ApiConfig;
use crate::dispatcher::CrudDispatcher;
use crate::rate_limiting::{RateLimitConfig, RateLimiter};
use crate::usage::{UsageRecorder, UsageWorkerHandle};
use nebuladb_core::Result;
use nebuladb_storage::{
    DatabaseLifecycle, MetadataStore, SchemaResolver, SqliteConnector, TenantConnectionPool,
};
use std::sync::Arc;
use tracing::info;

/// State handed to every handler
#[derive(Clone, Debug)]
pub struct AppState {
    pub metadata: Arc<MetadataStore>,
    pub dispatcher: CrudDispatcher,
    pub pool: Arc<TenantConnectionPool>,
    pub lifecycle: DatabaseLifecycle,
    pub api_keys: Arc<ApiKeyManager>,
    pub limiter: RateLimiter,
    /// Uncached API key validations per client address
    pub auth_attempts: RateLimiter,
    pub usage: UsageRecorder,
}

impl AppState {
    /// Open the metadata store, build the pool, and start the usage worker.
    ///
    /// Must be called inside a tokio runtime. The returned handle drains the
    /// usage queue at shutdown.
    pub fn build(config: &ApiConfig) -> Result<(Self, UsageWorkerHandle)> {
        config.validate()?;

        let metadata = Arc::new(MetadataStore::open(&config.metadata_db)?);
        let connector = SqliteConnector::new(config.tenant_storage_template.clone(), config.pool.clone())?;
        let pool = Arc::new(TenantConnectionPool::new(
            metadata.clone(),
            Arc::new(connector),
            config.credential_secret.clone(),
            config.pool.probe_timeout,
        ));

        let (usage, usage_handle) = UsageRecorder::spawn(metadata.clone(), &config.usage);
        let dispatcher = CrudDispatcher::new(
            metadata.clone(),
            metadata.clone(),
            SchemaResolver::new(metadata.clone()),
            pool.clone(),
            usage.clone(),
        );
        let lifecycle = DatabaseLifecycle::new(metadata.clone(), pool.clone());
        let api_keys = Arc::new(ApiKeyManager::new(&config.metadata_db, config.api_keys.clone())?);
        let limiter = RateLimiter::new(config.rate_limit.clone());
        let auth_attempts = RateLimiter::new(RateLimitConfig {
            limit: config.api_keys.max_attempts_per_window,
            ..config.rate_limit.clone()
        });

        info!(
            metadata_db = %config.metadata_db.display(),
            rate_limit = config.rate_limit.limit,
            window_secs = config.rate_limit.window_secs,
            "Application state initialized"
        );

        Ok((
            Self {
                metadata,
                dispatcher,
                pool,
                lifecycle,
                api_keys,
                limiter,
                auth_attempts,
                usage,
            },
            usage_handle,
        ))
    }
}
