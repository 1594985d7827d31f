//! API Key Authentication Module
//!
//! Supplies the authenticated caller identity for the data API. Keys are bound
//! to a principal (user id) and stored as bcrypt hashes in the metadata store.
//!
//! ## Configuration
//!
//! - `NEBULA_API_KEY_PREFIX`: Prefix for generated keys (default: "nb_")
//! - `NEBULA_API_KEY_LENGTH`: Random bytes per key (default: 32 bytes = 64 hex chars)
//! - `NEBULA_BCRYPT_COST`: bcrypt cost factor (default: 12, range: 4-31)
//! - `NEBULA_API_KEY_CACHE_TTL_SECS`: Validated key cache lifetime (default: 300)
//! - `NEBULA_API_KEY_MAX_ATTEMPTS`: Uncached validations per client address per
//!   rate-limit window (default: 20)
//!
//! ## Validation
//!
//! bcrypt hashes are salted, so validation loads every non-revoked key and
//! verifies each one. Valid keys are cached for the TTL, keyed by a hash of the
//! plaintext (the plaintext itself is never stored). Revocation clears the
//! whole cache.
//!
//! Tokens that are not shaped like a generated key are rejected before any
//! hashing. Uncached validations are budgeted per client address, so a caller
//! cycling through bad tokens cannot keep the bcrypt verifier busy.
//!
//! `last_used_at` is not written on the request path: used keys are queued and
//! persisted by [`ApiKeyManager::flush_pending_updates`].

use crate::error::ApiError;
use crate::rate_limiting::RateLimiter;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use bcrypt::{hash, verify};
use dashmap::DashMap;
use nebuladb_core::{now_timestamp, NebulaError, Result};
use rand::RngCore;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_API_KEY_PREFIX: &str = "nb_";
const DEFAULT_API_KEY_LENGTH: usize = 32;
const DEFAULT_BCRYPT_COST: u32 = 12;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_MAX_ATTEMPTS: u32 = 20;
const MIN_API_KEY_LENGTH: usize = 16;

/// Configuration for API key generation and validation
#[derive(Clone, Debug)]
pub struct ApiKeyConfig {
    pub prefix: String,
    pub key_length: usize,
    pub bcrypt_cost: u32,
    pub cache_ttl_secs: u64,
    pub max_attempts_per_window: u32,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_API_KEY_PREFIX.to_string(),
            key_length: DEFAULT_API_KEY_LENGTH,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_attempts_per_window: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ApiKeyConfig {
    pub fn from_env() -> Self {
        Self {
            prefix: std::env::var("NEBULA_API_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_API_KEY_PREFIX.to_string()),
            key_length: std::env::var("NEBULA_API_KEY_LENGTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_API_KEY_LENGTH),
            bcrypt_cost: std::env::var("NEBULA_BCRYPT_COST")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BCRYPT_COST),
            cache_ttl_secs: std::env::var("NEBULA_API_KEY_CACHE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CACHE_TTL_SECS),
            max_attempts_per_window: std::env::var("NEBULA_API_KEY_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(NebulaError::ValidationError(format!(
                "bcrypt cost must be between 4 and 31, got {}",
                self.bcrypt_cost
            )));
        }
        if self.key_length < MIN_API_KEY_LENGTH {
            return Err(NebulaError::ValidationError(format!(
                "API key length must be at least {} bytes",
                MIN_API_KEY_LENGTH
            )));
        }
        if self.max_attempts_per_window == 0 {
            return Err(NebulaError::ValidationError(
                "API key validation attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Authenticated caller attached to request extensions by [`identity_middleware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    /// Name of the key that authenticated the request
    pub key_name: String,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<Principal>().cloned().ok_or_else(|| {
            ApiError::Unauthorized(
                "API key required. Provide it as 'Authorization: Bearer <key>'".to_string(),
            )
        })
    }
}

/// API key metadata (returned by list_keys)
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub id: i64,
    pub name: String,
    pub user_id: String,
    pub created_at: String,
    pub revoked_at: Option<String>,
    pub last_used_at: Option<String>,
}

#[derive(Clone, Debug)]
struct CachedKey {
    bcrypt_hash: String,
    principal: Principal,
    cached_at: Instant,
}

/// Cache map key. Only used for lookup; never persisted.
fn cache_key_from_plaintext(plaintext: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    plaintext.hash(&mut hasher);
    hasher.finish()
}

fn join_error(e: tokio::task::JoinError) -> NebulaError {
    NebulaError::Other(format!("Task join error: {}", e))
}

/// API key manager with in-memory cache and deferred last-used writes
pub struct ApiKeyManager {
    config: ApiKeyConfig,
    db_path: PathBuf,
    cache: Arc<DashMap<u64, CachedKey>>,
    pending_updates: Arc<DashMap<String, Instant>>,
}

impl std::fmt::Debug for ApiKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyManager")
            .field("db_path", &self.db_path)
            .field("cached_keys", &self.cache.len())
            .field("pending_updates", &self.pending_updates.len())
            .finish()
    }
}

impl ApiKeyManager {
    pub fn new(db_path: impl AsRef<Path>, config: ApiKeyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            db_path: db_path.as_ref().to_path_buf(),
            cache: Arc::new(DashMap::new()),
            pending_updates: Arc::new(DashMap::new()),
        })
    }

    fn open(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Generate a key for `user_id` and store its hash.
    ///
    /// Returns the plaintext. This is the only time it is available.
    pub async fn create_key(&self, name: &str, user_id: &str) -> Result<String> {
        if name.trim().is_empty() {
            return Err(NebulaError::ValidationError(
                "API key name cannot be empty".to_string(),
            ));
        }
        if user_id.trim().is_empty() {
            return Err(NebulaError::ValidationError(
                "API key user id cannot be empty".to_string(),
            ));
        }

        let plaintext_key = self.generate_api_key();

        let key_hash = {
            let plaintext = plaintext_key.clone();
            let cost = self.config.bcrypt_cost;
            tokio::task::spawn_blocking(move || {
                hash(&plaintext, cost).map_err(|e| NebulaError::Other(e.to_string()))
            })
            .await
            .map_err(join_error)??
        };

        let db_path = self.db_path.clone();
        let name_owned = name.to_string();
        let user_owned = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = Self::open(&db_path)?;
            conn.execute(
                "INSERT INTO api_keys (key_hash, name, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key_hash, name_owned, user_owned, now_timestamp()],
            )?;
            Ok::<_, NebulaError>(())
        })
        .await
        .map_err(join_error)??;

        info!(name = %name, user_id = %user_id, "Created new API key");
        Ok(plaintext_key)
    }

    /// Resolve a plaintext key to its principal.
    ///
    /// `Ok(None)` for unknown or revoked keys.
    pub async fn validate_key(&self, plaintext_key: &str) -> Result<Option<Principal>> {
        if let Some(principal) = self.cached_principal(plaintext_key) {
            return Ok(Some(principal));
        }
        if !self.is_well_formed(plaintext_key) {
            debug!("API key validation: malformed key");
            return Ok(None);
        }
        let cache_key = cache_key_from_plaintext(plaintext_key);

        let db_path = self.db_path.clone();
        let plaintext = plaintext_key.to_string();
        let found = tokio::task::spawn_blocking(move || {
            let conn = Self::open(&db_path)?;
            let mut stmt = conn
                .prepare("SELECT key_hash, name, user_id FROM api_keys WHERE revoked_at IS NULL")?;
            let keys: Vec<(String, String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (key_hash, name, user_id) in keys {
                if verify(&plaintext, &key_hash).unwrap_or(false) {
                    return Ok::<_, NebulaError>(Some((key_hash, name, user_id)));
                }
            }
            Ok(None)
        })
        .await
        .map_err(join_error)??;

        match found {
            Some((bcrypt_hash, key_name, user_id)) => {
                let principal = Principal { user_id, key_name };
                self.cache.insert(
                    cache_key,
                    CachedKey {
                        bcrypt_hash: bcrypt_hash.clone(),
                        principal: principal.clone(),
                        cached_at: Instant::now(),
                    },
                );
                self.mark_key_used(&bcrypt_hash);
                debug!(user_id = %principal.user_id, key = %principal.key_name, "API key validated");
                Ok(Some(principal))
            }
            None => {
                warn!("API key validation failed");
                Ok(None)
            }
        }
    }

    /// Principal for a key validated within the cache TTL. Never hashes.
    pub fn cached_principal(&self, plaintext_key: &str) -> Option<Principal> {
        let cache_key = cache_key_from_plaintext(plaintext_key);
        let cached = self.cache.get(&cache_key).map(|c| c.clone())?;
        if cached.cached_at.elapsed() < Duration::from_secs(self.config.cache_ttl_secs) {
            debug!("API key validation: cache hit");
            self.mark_key_used(&cached.bcrypt_hash);
            return Some(cached.principal);
        }
        debug!("API key validation: cache expired");
        self.cache.remove(&cache_key);
        None
    }

    /// Configured prefix followed by the hex encoding of at least the minimum key length.
    fn is_well_formed(&self, plaintext_key: &str) -> bool {
        plaintext_key
            .strip_prefix(self.config.prefix.as_str())
            .and_then(|rest| hex::decode(rest).ok())
            .is_some_and(|bytes| bytes.len() >= MIN_API_KEY_LENGTH)
    }

    pub async fn list_keys(&self) -> Result<Vec<ApiKeyInfo>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Self::open(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT id, name, user_id, created_at, revoked_at, last_used_at
                 FROM api_keys ORDER BY created_at DESC, id DESC",
            )?;
            let keys = stmt
                .query_map([], |row| {
                    Ok(ApiKeyInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        user_id: row.get(2)?,
                        created_at: row.get(3)?,
                        revoked_at: row.get(4)?,
                        last_used_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
        .map_err(join_error)?
    }

    /// Revoke a key by id. Clears the whole validation cache.
    pub async fn revoke_key(&self, id: i64) -> Result<bool> {
        let db_path = self.db_path.clone();
        let rows = tokio::task::spawn_blocking(move || {
            let conn = Self::open(&db_path)?;
            let rows = conn.execute(
                "UPDATE api_keys SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
                rusqlite::params![now_timestamp(), id],
            )?;
            Ok::<usize, NebulaError>(rows)
        })
        .await
        .map_err(join_error)??;

        if rows > 0 {
            info!(id = id, "Revoked API key");
            // Cache entries cannot be mapped back to ids.
            self.cache.clear();
            self.pending_updates.clear();
            debug!("Cleared auth cache after key revocation");
            Ok(true)
        } else {
            warn!(id = id, "API key not found or already revoked");
            Ok(false)
        }
    }

    fn generate_api_key(&self) -> String {
        let mut rng = rand::rngs::OsRng;
        let mut bytes = vec![0u8; self.config.key_length];
        rng.fill_bytes(&mut bytes);
        format!("{}{}", self.config.prefix, hex::encode(&bytes))
    }

    fn mark_key_used(&self, bcrypt_hash: &str) {
        self.pending_updates
            .insert(bcrypt_hash.to_string(), Instant::now());
    }

    /// Persist queued `last_used_at` updates in one transaction.
    pub async fn flush_pending_updates(&self) -> Result<usize> {
        let updates: Vec<String> = self
            .pending_updates
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if updates.is_empty() {
            return Ok(0);
        }
        let count = updates.len();

        let db_path = self.db_path.clone();
        let flushed = updates.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open(&db_path)?;
            let tx = conn.transaction()?;
            let now = now_timestamp();
            for key_hash in &flushed {
                tx.execute(
                    "UPDATE api_keys SET last_used_at = ?1 WHERE key_hash = ?2",
                    rusqlite::params![now, key_hash],
                )?;
            }
            tx.commit()?;
            Ok::<_, NebulaError>(())
        })
        .await
        .map_err(join_error)??;

        for key_hash in &updates {
            self.pending_updates.remove(key_hash);
        }
        debug!(count = count, "Flushed last_used_at updates");
        Ok(count)
    }
}

/// Extract an API key from `Authorization: Bearer` or the `api_key` query parameter.
pub fn extract_api_key<B>(req: &axum::http::Request<B>) -> Option<String> {
    if let Some(auth_header) = req.headers().get(axum::http::header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some(("api_key", value)) if !value.is_empty() => Some(value.to_string()),
            _ => None,
        })
    })
}

/// State for [`identity_middleware`]
#[derive(Clone, Debug)]
pub struct IdentityState {
    pub keys: Arc<ApiKeyManager>,
    /// Budget of uncached key validations, keyed by client address
    pub attempts: RateLimiter,
}

/// Attach a [`Principal`] for requests carrying a valid key.
///
/// Never rejects: handlers that need identity extract [`Principal`], which
/// fails with 401 when it is absent. Once a client address exhausts its
/// validation budget, only cached keys are recognized until the window slides.
pub async fn identity_middleware(
    State(identity): State<IdentityState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(key) = extract_api_key(&req) {
        let principal = match identity.keys.cached_principal(&key) {
            Some(principal) => Some(principal),
            None => {
                let client = identity.attempts.client_key(&req);
                if identity.attempts.allow(&client).is_allowed() {
                    match identity.keys.validate_key(&key).await {
                        Ok(principal) => principal,
                        Err(e) => {
                            warn!(error = %e, "API key validation error (not attaching identity)");
                            None
                        }
                    }
                } else {
                    warn!(client = %client, "API key validation budget exhausted");
                    None
                }
            }
        };
        match principal {
            Some(principal) => {
                debug!(user_id = %principal.user_id, "Authenticated API key");
                req.extensions_mut().insert(principal);
            }
            None => warn!("Invalid API key provided (not attaching identity)"),
        }
    }
    next.run(req).await
}
