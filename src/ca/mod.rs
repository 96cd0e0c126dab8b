//! Certificate Authority Implementation
//!
//! Group-based certificate authority: authorization policy, key generation,
//! issuance, validity resolution, revocation with automatic re-issuance and
//! replication of the resulting state to a backup sink.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub mod keygen;
pub mod policy;
pub mod certificate_authority;
pub mod resolver;
pub mod revocation;
pub mod replication;

pub use keygen::*;
pub use policy::*;
pub use certificate_authority::CertificateIssuer;
pub use resolver::CertificateResolver;
pub use revocation::{RevocationManager, RevocationOutcome};
pub use replication::{
    ReplicationConfig, ReplicationCoordinator, ReplicationReport, BackupSnapshot, BackupFile,
};

/// Policy groups a certificate may be issued for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Group {
    RegionEast,
    RegionWest,
    RegionNorth,
    RegionSouth,
}

impl Group {
    /// Every group, in declaration order
    pub const ALL: [Group; 4] = [
        Group::RegionEast,
        Group::RegionWest,
        Group::RegionNorth,
        Group::RegionSouth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Group::RegionEast => "RegionEast",
            Group::RegionWest => "RegionWest",
            Group::RegionNorth => "RegionNorth",
            Group::RegionSouth => "RegionSouth",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Group::ALL
            .iter()
            .copied()
            .find(|group| group.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| format!("unknown group: {}", name))
    }
}

/// Certificate Authority Configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CAConfig {
    /// CA identifier recorded on every issued certificate
    pub ca_id: String,
    /// Certificate validity period
    pub cert_validity_days: u32,
    /// Key algorithm for newly issued certificates
    pub key_algorithm: KeyAlgorithm,
}

impl Default for CAConfig {
    fn default() -> Self {
        Self {
            ca_id: "groupca-localhost".to_string(),
            cert_validity_days: 365,
            key_algorithm: KeyAlgorithm::EcdsaP256,
        }
    }
}

impl CAConfig {
    pub fn validity_period(&self) -> Duration {
        Duration::from_secs(self.cert_validity_days as u64 * 24 * 60 * 60)
    }
}

/// Issued certificate information
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// Certificate serial number (upper-case hex)
    pub serial_number: String,
    /// Identity the certificate was issued to
    pub subject: String,
    /// Group embedded as OU, absent on the administrative path
    pub group: Option<Group>,
    /// Start of the validity window
    pub not_before: SystemTime,
    /// End of the validity window
    pub not_after: SystemTime,
    /// DER-encoded certificate
    pub certificate_der: Vec<u8>,
    /// PEM-encoded certificate
    pub certificate_pem: String,
    /// PEM-encoded public key
    pub public_key_pem: String,
    /// PEM-encoded private key, only when requested at issuance
    pub private_key_pem: Option<String>,
    /// Certificate fingerprint (SHA-256)
    pub fingerprint: [u8; 32],
    /// Issuing CA ID
    pub issuer_ca_id: String,
}

impl IssuedCertificate {
    /// Distinguished name as written into the certificate
    pub fn distinguished_name(&self) -> String {
        match self.group {
            Some(group) => format!("CN={}, OU={}", self.subject, group),
            None => format!("CN={}", self.subject),
        }
    }

    pub fn is_within_validity(&self, at: SystemTime) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    pub fn without_private_key(&self) -> Self {
        Self {
            private_key_pem: None,
            ..self.clone()
        }
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }
}

/// Canonical form of a serial number as accepted from callers
pub fn normalize_serial(serial: &str) -> String {
    serial
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | ' '))
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Per-subject async locks shared by issuance and revocation. An entry lives
/// only while some task holds or waits for it.
#[derive(Default)]
pub struct SubjectLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a storage key
    pub async fn lock(&self, key: &str) -> SubjectGuard<'_> {
        // Cloned under the shard lock, so release cannot race the count check
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;
        SubjectGuard {
            locks: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }
}

/// Held subject lock; the table entry is dropped with the last user
pub struct SubjectGuard<'a> {
    locks: &'a SubjectLocks,
    key: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SubjectGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Ours plus the table's
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| {
                Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
            });
    }
}

/// CA metrics for monitoring
#[derive(Debug, Default)]
pub struct CAMetrics {
    pub certificates_issued: AtomicU64,
    pub revocations: AtomicU64,
    pub authorization_denials: AtomicU64,
    pub replication_pushes: AtomicU64,
    pub replication_failures: AtomicU64,
}

/// Point-in-time copy of [`CAMetrics`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CAMetricsSnapshot {
    pub certificates_issued: u64,
    pub revocations: u64,
    pub authorization_denials: u64,
    pub replication_pushes: u64,
    pub replication_failures: u64,
}

impl CAMetrics {
    pub fn snapshot(&self) -> CAMetricsSnapshot {
        CAMetricsSnapshot {
            certificates_issued: self.certificates_issued.load(Ordering::Relaxed),
            revocations: self.revocations.load(Ordering::Relaxed),
            authorization_denials: self.authorization_denials.load(Ordering::Relaxed),
            replication_pushes: self.replication_pushes.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
