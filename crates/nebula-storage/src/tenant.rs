//! Validated logical database identifiers.
//!
//! Every pool key and storage path is derived from a [`DatabaseId`], so the
//! validation here is what keeps `{database_id}` template substitution safe.
//!
//! ```rust,ignore
//! use nebuladb_storage::tenant::DatabaseId;
//!
//! let id = DatabaseId::new("db-acme-main")?;
//! assert_eq!(id.as_str(), "db-acme-main");
//! ```

use nebuladb_core::{validation, NebulaError, Result};
use std::fmt;

/// Minimum length for database identifiers.
pub const MIN_DATABASE_ID_LEN: usize = 3;

/// Maximum length for database identifiers.
pub const MAX_DATABASE_ID_LEN: usize = 63;

/// Validated logical database identifier.
///
/// # Validation Rules
///
/// - Length: 3-63 characters
/// - Characters: ASCII alphanumeric, underscore, hyphen
/// - Must start with alphanumeric character
/// - Cannot end with hyphen
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseId(String);

impl DatabaseId {
    /// Create a new validated identifier.
    ///
    /// # Errors
    ///
    /// Returns `NebulaError::ValidationError` if the identifier:
    /// - Is too short (< 3 chars) or too long (> 63 chars)
    /// - Contains characters other than alphanumeric, `_`, `-`
    /// - Starts with a hyphen or underscore
    /// - Ends with a hyphen
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    fn validate(id: &str) -> Result<()> {
        validation::validate_identifier(id, "database_id")?;

        if id.len() < MIN_DATABASE_ID_LEN {
            return Err(NebulaError::ValidationError(format!(
                "database_id too short: {} < {} characters",
                id.len(),
                MIN_DATABASE_ID_LEN
            )));
        }

        if id.len() > MAX_DATABASE_ID_LEN {
            return Err(NebulaError::ValidationError(format!(
                "database_id too long: {} > {} characters",
                id.len(),
                MAX_DATABASE_ID_LEN
            )));
        }

        if let Some(first) = id.chars().next() {
            if !first.is_ascii_alphanumeric() {
                return Err(NebulaError::ValidationError(
                    "database_id must start with alphanumeric character".to_string(),
                ));
            }
        }

        if id.ends_with('-') {
            return Err(NebulaError::ValidationError(
                "database_id cannot end with hyphen".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DatabaseId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_database_ids() {
        assert!(DatabaseId::new("db1").is_ok());
        assert!(DatabaseId::new("acme-main").is_ok());
        assert!(DatabaseId::new("db_0f3a9c").is_ok());
        assert!(DatabaseId::new("a".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_database_ids() {
        assert!(DatabaseId::new("ab").is_err());
        assert!(DatabaseId::new("a".repeat(64)).is_err());
        assert!(DatabaseId::new("-leading").is_err());
        assert!(DatabaseId::new("_leading").is_err());
        assert!(DatabaseId::new("trailing-").is_err());
        assert!(DatabaseId::new("../../etc").is_err());
        assert!(DatabaseId::new("has space").is_err());
        assert!(DatabaseId::new("dé-unicode").is_err());
    }

    #[test]
    fn test_display_and_into_string() {
        let id = DatabaseId::new("acme-main").unwrap();
        assert_eq!(id.to_string(), "acme-main");
        assert_eq!(id.as_ref(), "acme-main");
        assert_eq!(id.into_string(), "acme-main".to_string());
    }
}
