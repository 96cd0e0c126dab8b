//! In-memory storage, for tests and localhost operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ca::{normalize_serial, IssuedCertificate};
use crate::errors::{StorageError, Result as GroupCaResult};
use super::{CertificateStore, RevocationLedger};

#[derive(Default)]
struct StoreState {
    by_key: HashMap<String, Vec<IssuedCertificate>>,
    serials: HashSet<String>,
}

/// Certificate store held in memory
#[derive(Clone, Default)]
pub struct MemoryCertificateStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn insert(&self, key: &str, certificate: IssuedCertificate) -> GroupCaResult<()> {
        let mut state = self.state.write().await;
        if state.serials.contains(&certificate.serial_number) {
            return Err(StorageError::DuplicateSerial {
                serial: certificate.serial_number,
            }
            .into());
        }
        state.serials.insert(certificate.serial_number.clone());
        state.by_key.entry(key.to_string()).or_default().push(certificate);
        Ok(())
    }

    async fn certificates_for(&self, key: &str) -> GroupCaResult<Vec<IssuedCertificate>> {
        let state = self.state.read().await;
        Ok(state.by_key.get(key).cloned().unwrap_or_default())
    }

    async fn contains_serial(&self, serial: &str) -> GroupCaResult<bool> {
        let state = self.state.read().await;
        Ok(state.serials.contains(serial))
    }

    async fn snapshot(&self) -> GroupCaResult<BTreeMap<String, Vec<IssuedCertificate>>> {
        let state = self.state.read().await;
        Ok(state
            .by_key
            .iter()
            .map(|(key, certs)| (key.clone(), certs.clone()))
            .collect())
    }
}

#[derive(Default)]
struct LedgerState {
    order: Vec<String>,
    members: HashSet<String>,
}

/// Revocation ledger held in memory
#[derive(Clone, Default)]
pub struct MemoryRevocationLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl MemoryRevocationLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationLedger for MemoryRevocationLedger {
    async fn append(&self, serial: &str) -> GroupCaResult<bool> {
        let serial = normalize_serial(serial);
        let mut state = self.state.write().await;
        if !state.members.insert(serial.clone()) {
            return Ok(false);
        }
        state.order.push(serial);
        Ok(true)
    }

    async fn contains(&self, serial: &str) -> GroupCaResult<bool> {
        let state = self.state.read().await;
        Ok(state.members.contains(&normalize_serial(serial)))
    }

    async fn all_revoked(&self) -> GroupCaResult<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.order.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GroupCaError;
    use std::time::SystemTime;

    fn create_test_certificate(serial: &str, subject: &str) -> IssuedCertificate {
        let now = SystemTime::now();
        IssuedCertificate {
            serial_number: serial.to_string(),
            subject: subject.to_string(),
            group: None,
            not_before: now,
            not_after: now,
            certificate_der: vec![0x30, 0x00],
            certificate_pem: String::new(),
            public_key_pem: String::new(),
            private_key_pem: None,
            fingerprint: [0u8; 32],
            issuer_ca_id: "test-ca".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_preserves_order() {
        let store = MemoryCertificateStore::new();
        store.insert("alice", create_test_certificate("01", "alice")).await.unwrap();
        store.insert("alice", create_test_certificate("02", "alice")).await.unwrap();
        store.insert("bob", create_test_certificate("03", "bob")).await.unwrap();

        let certs = store.certificates_for("alice").await.unwrap();
        let serials: Vec<_> = certs.iter().map(|c| c.serial_number.as_str()).collect();
        assert_eq!(serials, vec!["01", "02"]);
        assert!(store.certificates_for("carol").await.unwrap().is_empty());
        assert_eq!(store.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_serial_rejected_across_subjects() {
        let store = MemoryCertificateStore::new();
        store.insert("alice", create_test_certificate("01", "alice")).await.unwrap();

        let result = store.insert("bob", create_test_certificate("01", "bob")).await;
        assert!(matches!(
            result,
            Err(GroupCaError::Storage(StorageError::DuplicateSerial { .. }))
        ));
        assert!(store.certificates_for("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_append_is_idempotent() {
        let ledger = MemoryRevocationLedger::new();
        assert!(ledger.append("0a1b").await.unwrap());
        assert!(!ledger.append("0A1B").await.unwrap());

        assert!(ledger.contains("0a1b").await.unwrap());
        assert_eq!(ledger.all_revoked().await.unwrap(), vec!["0A1B".to_string()]);
    }
}
