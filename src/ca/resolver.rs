//! Certificate validity resolution.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::errors::Result as GroupCaResult;
use crate::store::{storage_key, CertificateStore, RevocationLedger};
use super::{normalize_serial, IssuedCertificate};

/// Answers "which certificate is usable" by reading the store and the ledger
#[derive(Clone)]
pub struct CertificateResolver {
    store: Arc<dyn CertificateStore>,
    ledger: Arc<dyn RevocationLedger>,
}

impl CertificateResolver {
    pub fn new(store: Arc<dyn CertificateStore>, ledger: Arc<dyn RevocationLedger>) -> Self {
        Self { store, ledger }
    }

    /// The subject's newest non-revoked certificate. Newest means latest
    /// `not_before`, ties going to the later insertion.
    pub async fn current_valid(&self, subject: &str) -> GroupCaResult<Option<IssuedCertificate>> {
        let certificates = self.history(subject).await?;

        let mut current: Option<IssuedCertificate> = None;
        for cert in certificates {
            if self.ledger.contains(&cert.serial_number).await? {
                continue;
            }
            let newer = current
                .as_ref()
                .map_or(true, |best| cert.not_before >= best.not_before);
            if newer {
                current = Some(cert);
            }
        }
        Ok(current)
    }

    /// The subject's most recently issued certificate, revoked or not
    pub async fn latest_issued(&self, subject: &str) -> GroupCaResult<Option<IssuedCertificate>> {
        Ok(self.history(subject).await?.pop())
    }

    /// Linear scan over every subject
    pub async fn find_by_serial(&self, serial: &str) -> GroupCaResult<Option<IssuedCertificate>> {
        let serial = normalize_serial(serial);
        let snapshot = self.store.snapshot().await?;
        let found = snapshot
            .into_values()
            .flatten()
            .find(|cert| cert.serial_number == serial);
        if found.is_none() {
            debug!("No certificate with serial {}", serial);
        }
        Ok(found)
    }

    pub async fn is_revoked(&self, serial: &str) -> GroupCaResult<bool> {
        self.ledger.contains(serial).await
    }

    /// Not revoked and inside its validity window right now
    pub async fn is_valid(&self, certificate: &IssuedCertificate) -> GroupCaResult<bool> {
        self.is_valid_at(certificate, SystemTime::now()).await
    }

    pub async fn is_valid_at(
        &self,
        certificate: &IssuedCertificate,
        at: SystemTime,
    ) -> GroupCaResult<bool> {
        if self.is_revoked(&certificate.serial_number).await? {
            return Ok(false);
        }
        Ok(certificate.is_within_validity(at))
    }

    /// `is_valid` for a serial; unknown serials are not valid
    pub async fn validate(&self, serial: &str) -> GroupCaResult<bool> {
        match self.find_by_serial(serial).await? {
            Some(cert) => self.is_valid(&cert).await,
            None => Ok(false),
        }
    }

    /// Issuance history of exactly this subject. Distinct subjects can share
    /// a storage key, so the key's sequence is filtered by subject.
    async fn history(&self, subject: &str) -> GroupCaResult<Vec<IssuedCertificate>> {
        let key = storage_key(subject)?;
        let subject = subject.trim();
        Ok(self
            .store
            .certificates_for(&key)
            .await?
            .into_iter()
            .filter(|cert| cert.subject == subject)
            .collect())
    }
}
