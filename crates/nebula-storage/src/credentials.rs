//! Per-tenant credential derivation.
//!
//! Each logical database gets its own credential, derived from the server's
//! master secret and the database id. The credential never leaves the process;
//! stores persist only its fingerprint and refuse to open when it does not match.

use sha2::{Digest, Sha256};
use std::fmt;

/// Credential used to open one tenant store
#[derive(Clone)]
pub struct DerivedCredential {
    /// Login name, derived from the database id prefix
    pub user: String,
    secret: String,
}

impl DerivedCredential {
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// One-way fingerprint persisted next to tenant data.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user.as_bytes());
        hasher.update(b":");
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for DerivedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedCredential")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Derive the credential for `database_id` from the master secret.
pub fn derive_credential(master_secret: &str, database_id: &str) -> DerivedCredential {
    let prefix: String = database_id.chars().take(8).collect();

    let mut hasher = Sha256::new();
    hasher.update(master_secret.as_bytes());
    hasher.update(b"/");
    hasher.update(database_id.as_bytes());

    DerivedCredential {
        user: format!("nb_{}", prefix),
        secret: hex::encode(hasher.finalize()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic_per_database() {
        let a1 = derive_credential("master", "db-alpha");
        let a2 = derive_credential("master", "db-alpha");
        let b = derive_credential("master", "db-beta");

        assert_eq!(a1.secret(), a2.secret());
        assert_ne!(a1.secret(), b.secret());
        assert_eq!(a1.user, "nb_db-alpha");
        assert_eq!(a1.fingerprint(), a2.fingerprint());
    }

    #[test]
    fn test_master_secret_changes_credential() {
        let a = derive_credential("one", "db-alpha");
        let b = derive_credential("two", "db-alpha");
        assert_ne!(a.secret(), b.secret());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cred = derive_credential("master", "db-alpha");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains(cred.secret()));
        assert!(debug.contains("redacted"));
    }
}
