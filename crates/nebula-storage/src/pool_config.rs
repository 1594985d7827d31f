//! Connection limits for tenant stores.
//!
//! ## Configuration
//!
//! - `NEBULA_POOL_MAX_OPEN`: Open connections per database (default: 10)
//! - `NEBULA_POOL_MAX_IDLE`: Idle connections kept per database (default: 2)
//! - `NEBULA_POOL_MAX_LIFETIME_SECS`: Connection lifetime (default: 3600)
//! - `NEBULA_POOL_ACQUIRE_TIMEOUT_SECS`: Wait for a free connection (default: 5)
//! - `NEBULA_POOL_PROBE_TIMEOUT_SECS`: Liveness probe timeout (default: 2)

use nebuladb_core::{NebulaError, Result};
use std::time::Duration;

pub const DEFAULT_MAX_OPEN: usize = 10;
pub const DEFAULT_MAX_IDLE: usize = 2;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 3600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 2;

/// Per-database connection limits
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
    /// Maximum concurrently open connections to one database
    pub max_open: usize,
    /// Maximum idle connections retained for reuse
    pub max_idle: usize,
    /// Connections older than this are closed instead of reused
    pub max_lifetime: Duration,
    /// How long a caller waits for a free connection
    pub acquire_timeout: Duration,
    /// Deadline for the liveness probe run on new pool entries
    pub probe_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_MAX_OPEN,
            max_idle: DEFAULT_MAX_IDLE,
            max_lifetime: Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ConnectionPoolConfig {
    /// Load limits from `NEBULA_POOL_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            max_open: env_or("NEBULA_POOL_MAX_OPEN", DEFAULT_MAX_OPEN),
            max_idle: env_or("NEBULA_POOL_MAX_IDLE", DEFAULT_MAX_IDLE),
            max_lifetime: Duration::from_secs(env_or(
                "NEBULA_POOL_MAX_LIFETIME_SECS",
                DEFAULT_MAX_LIFETIME_SECS,
            )),
            acquire_timeout: Duration::from_secs(env_or(
                "NEBULA_POOL_ACQUIRE_TIMEOUT_SECS",
                DEFAULT_ACQUIRE_TIMEOUT_SECS,
            )),
            probe_timeout: Duration::from_secs(env_or(
                "NEBULA_POOL_PROBE_TIMEOUT_SECS",
                DEFAULT_PROBE_TIMEOUT_SECS,
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open == 0 {
            return Err(NebulaError::ValidationError(
                "max_open must be at least 1".to_string(),
            ));
        }
        if self.max_idle > self.max_open {
            return Err(NebulaError::ValidationError(format!(
                "max_idle ({}) cannot exceed max_open ({})",
                self.max_idle, self.max_open
            )));
        }
        if self.max_lifetime.is_zero() {
            return Err(NebulaError::ValidationError(
                "max_lifetime must be positive".to_string(),
            ));
        }
        if self.acquire_timeout.is_zero() || self.probe_timeout.is_zero() {
            return Err(NebulaError::ValidationError(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_tenant_limits() {
        let config = ConnectionPoolConfig::default();
        assert_eq!(config.max_open, 10);
        assert_eq!(config.max_idle, 2);
        assert_eq!(config.max_lifetime, Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("NEBULA_POOL_MAX_OPEN", "4");
        std::env::set_var("NEBULA_POOL_MAX_IDLE", "not-a-number");
        let config = ConnectionPoolConfig::from_env();
        std::env::remove_var("NEBULA_POOL_MAX_OPEN");
        std::env::remove_var("NEBULA_POOL_MAX_IDLE");

        assert_eq!(config.max_open, 4);
        assert_eq!(config.max_idle, DEFAULT_MAX_IDLE);
    }

    #[test]
    fn test_validate_rejects_inconsistent_limits() {
        let config = ConnectionPoolConfig {
            max_idle: 5,
            max_open: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ConnectionPoolConfig {
            max_open: 0,
            max_idle: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
