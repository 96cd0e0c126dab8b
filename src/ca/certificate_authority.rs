//! Certificate issuance
//!
//! Builds a fresh key pair and a self-signed X.509 certificate for a subject,
//! records it durably, then replicates. The subject lock is shared with
//! revocation so an issuance never interleaves with a revoke-then-reissue of
//! the same subject.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyUsagePurpose,
    SerialNumber,
};
use tracing::{debug, info, warn};

use crate::errors::{CryptoError, GroupCaError, Result as GroupCaResult};
use crate::store::{storage_key, CertificateStore};
use super::{
    CAConfig, CAMetrics, Group, IssuedCertificate, KeyPairGenerator, ReplicationCoordinator,
    SubjectLocks,
};

/// Attempts at drawing a serial not yet present in the store
const MAX_SERIAL_ATTEMPTS: usize = 8;

/// Issues certificates and records them in the certificate store
pub struct CertificateIssuer {
    store: Arc<dyn CertificateStore>,
    key_generator: Arc<dyn KeyPairGenerator>,
    replication: Arc<ReplicationCoordinator>,
    locks: Arc<SubjectLocks>,
    config: CAConfig,
    metrics: Arc<CAMetrics>,
}

impl CertificateIssuer {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        key_generator: Arc<dyn KeyPairGenerator>,
        replication: Arc<ReplicationCoordinator>,
        locks: Arc<SubjectLocks>,
        config: CAConfig,
        metrics: Arc<CAMetrics>,
    ) -> Self {
        Self {
            store,
            key_generator,
            replication,
            locks,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &CAConfig {
        &self.config
    }

    /// Issue a certificate for `subject`, with `group` as OU when present.
    /// The private key is returned only when `include_private_key` is set.
    pub async fn issue(
        &self,
        subject: &str,
        group: Option<Group>,
        include_private_key: bool,
    ) -> GroupCaResult<IssuedCertificate> {
        let key = storage_key(subject)?;
        let certificate = {
            let _guard = self.locks.lock(&key).await;
            self.issue_locked(&key, subject, group, include_private_key).await?
        };

        self.replication.sync_all().await;
        Ok(certificate)
    }

    /// Issue while the caller holds the subject lock for `key`. Does not
    /// replicate.
    pub(crate) async fn issue_locked(
        &self,
        key: &str,
        subject: &str,
        group: Option<Group>,
        include_private_key: bool,
    ) -> GroupCaResult<IssuedCertificate> {
        let subject = subject.trim();
        let start_time = std::time::Instant::now();
        info!("Issuing certificate for: {}", subject);

        let serial = self.allocate_serial().await?;
        let certificate = self.build_certificate(subject, group, &serial, include_private_key)?;

        // Nothing is visible before this succeeds
        self.store.insert(key, certificate.clone()).await?;
        CAMetrics::incr(&self.metrics.certificates_issued);

        info!(
            "Certificate issued: {} for {} ({}ms)",
            certificate.serial_number,
            certificate.distinguished_name(),
            start_time.elapsed().as_millis()
        );
        Ok(certificate)
    }

    async fn allocate_serial(&self) -> GroupCaResult<[u8; 16]> {
        for _ in 0..MAX_SERIAL_ATTEMPTS {
            let serial = random_serial();
            if !self.store.contains_serial(&hex::encode_upper(serial)).await? {
                return Ok(serial);
            }
            warn!("Serial collision, drawing again");
        }
        Err(GroupCaError::Internal {
            message: format!("no unique serial after {} attempts", MAX_SERIAL_ATTEMPTS),
        })
    }

    fn build_certificate(
        &self,
        subject: &str,
        group: Option<Group>,
        serial: &[u8; 16],
        include_private_key: bool,
    ) -> GroupCaResult<IssuedCertificate> {
        let key_pair = self.key_generator.generate()?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, subject);
        if let Some(group) = group {
            distinguished_name.push(DnType::OrganizationalUnitName, group.as_str());
        }

        // X.509 times have whole-second precision
        let not_before = whole_seconds(SystemTime::now());
        let not_after = not_before + self.config.validity_period();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        params.serial_number = Some(SerialNumber::from_slice(serial));
        params.not_before = not_before.into();
        params.not_after = not_after.into();
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CryptoError::CertificateGeneration {
                reason: e.to_string(),
            })?;

        let certificate_der = cert.der().to_vec();
        let fingerprint = calculate_fingerprint(&certificate_der);
        debug!("Certificate fingerprint: {}", hex::encode(fingerprint));

        Ok(IssuedCertificate {
            serial_number: hex::encode_upper(serial),
            subject: subject.to_string(),
            group,
            not_before,
            not_after,
            certificate_der,
            certificate_pem: cert.pem(),
            public_key_pem: key_pair.public_key_pem(),
            private_key_pem: include_private_key.then(|| key_pair.serialize_pem()),
            fingerprint,
            issuer_ca_id: self.config.ca_id.clone(),
        })
    }
}

/// 128 random bits as a positive, non-zero-leading DER integer
fn random_serial() -> [u8; 16] {
    let mut serial: [u8; 16] = rand::random();
    serial[0] = (serial[0] & 0x7f) | 0x01;
    serial
}

fn whole_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn calculate_fingerprint(cert_der: &[u8]) -> [u8; 32] {
    use sha2::{Sha256, Digest};
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{KeyAlgorithm, RcgenKeyPairGenerator, ReplicationConfig};
    use crate::errors::StorageError;
    use crate::sinks::{BackupSink, MemoryBackupSink};
    use crate::store::{FileCertificateStore, MemoryCertificateStore, MemoryRevocationLedger};
    use async_trait::async_trait;
    use rcgen::KeyPair;
    use x509_parser::prelude::*;
    use std::time::Duration;

    struct BrokenKeyGenerator;

    impl KeyPairGenerator for BrokenKeyGenerator {
        fn generate(&self) -> GroupCaResult<KeyPair> {
            Err(CryptoError::KeyGeneration {
                algorithm: "ecdsa-p256".to_string(),
                reason: "entropy source unavailable".to_string(),
            }
            .into())
        }

        fn algorithm(&self) -> KeyAlgorithm {
            KeyAlgorithm::EcdsaP256
        }
    }

    struct StalledSink;

    #[async_trait]
    impl BackupSink for StalledSink {
        async fn push(&self, _file_name: &str, _content: Vec<u8>) -> GroupCaResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn create_test_issuer(
        key_generator: Arc<dyn KeyPairGenerator>,
    ) -> (CertificateIssuer, MemoryCertificateStore, Arc<MemoryBackupSink>) {
        let store = MemoryCertificateStore::new();
        let sink = Arc::new(MemoryBackupSink::new());
        let metrics = Arc::new(CAMetrics::default());
        let replication = Arc::new(ReplicationCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(MemoryRevocationLedger::new()),
            Some(sink.clone()),
            ReplicationConfig::default(),
            metrics.clone(),
        ));
        let issuer = CertificateIssuer::new(
            Arc::new(store.clone()),
            key_generator,
            replication,
            Arc::new(SubjectLocks::new()),
            CAConfig::default(),
            metrics,
        );
        (issuer, store, sink)
    }

    #[tokio::test]
    async fn test_issued_certificate_carries_subject_group_and_serial() {
        let (issuer, store, _sink) = create_test_issuer(Arc::new(RcgenKeyPairGenerator::default()));

        let issued = issuer
            .issue("CORP\\alice", Some(Group::RegionEast), false)
            .await
            .unwrap();
        assert_eq!(issued.subject, "CORP\\alice");
        assert_eq!(issued.serial_number.len(), 32);
        assert!(issued.private_key_pem.is_none());
        assert_eq!(issued.not_after.duration_since(issued.not_before).unwrap(),
                   CAConfig::default().validity_period());

        let (_, parsed) = X509Certificate::from_der(&issued.certificate_der).unwrap();
        let cn = parsed.subject().iter_common_name().next().unwrap().as_str().unwrap();
        let ou = parsed
            .subject()
            .iter_organizational_unit()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, "CORP\\alice");
        assert_eq!(ou, "RegionEast");
        assert_eq!(hex::encode_upper(parsed.raw_serial()), issued.serial_number);

        assert_eq!(store.certificates_for("CORPalice").await.unwrap(), vec![issued]);
    }

    #[tokio::test]
    async fn test_administrative_issue_omits_group_and_returns_key() {
        let (issuer, _store, _sink) = create_test_issuer(Arc::new(RcgenKeyPairGenerator::default()));

        let issued = issuer.issue("svc-backup", None, true).await.unwrap();
        assert!(issued.private_key_pem.as_deref().unwrap().contains("PRIVATE KEY"));

        let (_, parsed) = X509Certificate::from_der(&issued.certificate_der).unwrap();
        assert!(parsed.subject().iter_organizational_unit().next().is_none());
    }

    #[tokio::test]
    async fn test_serials_are_unique() {
        let (issuer, _store, _sink) = create_test_issuer(Arc::new(RcgenKeyPairGenerator::default()));

        let mut serials = std::collections::HashSet::new();
        for _ in 0..5 {
            let issued = issuer.issue("bob", Some(Group::RegionWest), false).await.unwrap();
            assert!(serials.insert(issued.serial_number));
        }
    }

    #[tokio::test]
    async fn test_issue_replicates() {
        let (issuer, _store, sink) = create_test_issuer(Arc::new(RcgenKeyPairGenerator::default()));

        issuer.issue("carol", Some(Group::RegionNorth), false).await.unwrap();
        assert!(sink.file("carol.json").is_some());
        assert!(sink.file("RevocationList.txt").is_some());
    }

    #[tokio::test]
    async fn test_failed_key_generation_leaves_no_record() {
        let (issuer, store, _sink) = create_test_issuer(Arc::new(BrokenKeyGenerator));

        let err = issuer.issue("dave", Some(Group::RegionSouth), false).await.unwrap_err();
        assert!(matches!(err, GroupCaError::Cryptographic(_)));
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_store_write_leaves_no_record() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("certificates");
        let store = Arc::new(FileCertificateStore::open(&data_dir).await.unwrap());
        let metrics = Arc::new(CAMetrics::default());
        let replication = Arc::new(ReplicationCoordinator::new(
            store.clone(),
            Arc::new(MemoryRevocationLedger::new()),
            None,
            ReplicationConfig::default(),
            metrics.clone(),
        ));
        let issuer = CertificateIssuer::new(
            store.clone(),
            Arc::new(RcgenKeyPairGenerator::default()),
            replication,
            Arc::new(SubjectLocks::new()),
            CAConfig::default(),
            metrics.clone(),
        );

        let first = issuer.issue("alice", Some(Group::RegionEast), false).await.unwrap();
        std::fs::remove_dir_all(&data_dir).unwrap();

        let err = issuer.issue("alice", Some(Group::RegionEast), false).await.unwrap_err();
        assert!(matches!(err, GroupCaError::Storage(StorageError::FileSystem { .. })));
        assert_eq!(store.certificates_for("alice").await.unwrap(), vec![first.clone()]);
        assert!(store.contains_serial(&first.serial_number).await.unwrap());

        let err = issuer.issue("bob", None, true).await.unwrap_err();
        assert!(matches!(err, GroupCaError::Storage(_)));
        assert!(store.certificates_for("bob").await.unwrap().is_empty());
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
        assert_eq!(metrics.snapshot().certificates_issued, 1);
    }

    #[tokio::test]
    async fn test_stalled_backup_does_not_hold_up_issuance() {
        let store = MemoryCertificateStore::new();
        let metrics = Arc::new(CAMetrics::default());
        let replication = Arc::new(ReplicationCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(MemoryRevocationLedger::new()),
            Some(Arc::new(StalledSink)),
            ReplicationConfig {
                push_timeout: Duration::from_millis(50),
                ..ReplicationConfig::default()
            },
            metrics.clone(),
        ));
        let issuer = CertificateIssuer::new(
            Arc::new(store.clone()),
            Arc::new(RcgenKeyPairGenerator::default()),
            replication,
            Arc::new(SubjectLocks::new()),
            CAConfig::default(),
            metrics.clone(),
        );

        let (seed_issuer, seed_store, _) =
            create_test_issuer(Arc::new(RcgenKeyPairGenerator::default()));
        for i in 0..40 {
            seed_issuer.issue(&format!("user{:02}", i), None, false).await.unwrap();
        }
        for (key, certificates) in seed_store.snapshot().await.unwrap() {
            for certificate in certificates {
                store.insert(&key, certificate).await.unwrap();
            }
        }

        let started = std::time::Instant::now();
        let issued = issuer.issue("alice", Some(Group::RegionEast), false).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(store.certificates_for("alice").await.unwrap(), vec![issued]);
        assert_eq!(metrics.snapshot().replication_failures, 1);
    }

    #[tokio::test]
    async fn test_invalid_subject_rejected() {
        let (issuer, store, _sink) = create_test_issuer(Arc::new(RcgenKeyPairGenerator::default()));

        let err = issuer.issue("\\/", None, false).await.unwrap_err();
        assert!(matches!(err, GroupCaError::InvalidSubject { .. }));
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[test]
    fn test_random_serial_is_positive() {
        for _ in 0..64 {
            let serial = random_serial();
            assert!(serial[0] & 0x80 == 0);
            assert!(serial[0] != 0);
        }
    }
}
