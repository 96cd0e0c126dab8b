//! Certificate and Revocation Storage
//!
//! Storage abstractions for issued certificates and the revocation ledger,
//! with in-memory and file-backed implementations. Core logic only talks to
//! the traits; nothing outside this module knows about paths.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::ca::IssuedCertificate;
use crate::errors::{GroupCaError, Result as GroupCaResult};

pub mod memory;
pub mod file;

pub use memory::{MemoryCertificateStore, MemoryRevocationLedger};
pub use file::{FileCertificateStore, FileRevocationLedger, REVOCATION_LIST_FILE};

/// Durable collection of issued certificates keyed by storage key
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Append a certificate to the key's sequence. Rejects serials already
    /// present anywhere in the store; on error nothing is retained.
    async fn insert(&self, key: &str, certificate: IssuedCertificate) -> GroupCaResult<()>;

    /// Certificates for a key in issuance order
    async fn certificates_for(&self, key: &str) -> GroupCaResult<Vec<IssuedCertificate>>;

    async fn contains_serial(&self, serial: &str) -> GroupCaResult<bool>;

    /// Full copy of the store, keyed by storage key
    async fn snapshot(&self) -> GroupCaResult<BTreeMap<String, Vec<IssuedCertificate>>>;
}

/// Append-only set of revoked serials
#[async_trait]
pub trait RevocationLedger: Send + Sync {
    /// Returns `true` when the serial was newly added, `false` if already present.
    async fn append(&self, serial: &str) -> GroupCaResult<bool>;

    async fn contains(&self, serial: &str) -> GroupCaResult<bool>;

    /// Revoked serials in append order, without duplicates
    async fn all_revoked(&self) -> GroupCaResult<Vec<String>>;
}

/// Derive the storage key for a subject by stripping characters that are
/// unsafe in file names and storage keys.
pub fn storage_key(subject: &str) -> GroupCaResult<String> {
    let key: String = subject
        .trim()
        .chars()
        .filter(|c| {
            !c.is_control()
                && !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
        })
        .collect();
    let key = key.trim().trim_start_matches('.').to_string();

    if key.is_empty() {
        return Err(GroupCaError::InvalidSubject {
            subject: subject.to_string(),
            reason: "subject is empty after sanitization".to_string(),
        });
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_strips_separators() {
        assert_eq!(storage_key("CORP\\alice").unwrap(), "CORPalice");
        assert_eq!(storage_key("a/b:c").unwrap(), "abc");
        assert_eq!(storage_key("  bob  ").unwrap(), "bob");
        assert_eq!(storage_key("../etc").unwrap(), "etc");
    }

    #[test]
    fn test_storage_key_rejects_empty() {
        assert!(storage_key("").is_err());
        assert!(storage_key("\\//").is_err());
        assert!(matches!(
            storage_key("..").unwrap_err(),
            GroupCaError::InvalidSubject { .. }
        ));
    }
}
