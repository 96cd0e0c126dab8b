//! GroupCA - Group-Based Internal Certificate Authority
//!
//! Issues identity certificates to members of a fixed set of policy groups,
//! keeps an append-only revocation ledger, answers validity queries and
//! re-issues automatically on revocation. Every mutation is replicated to a
//! backup sink.

pub mod ca;
pub mod store;
pub mod sinks;
pub mod audit;
pub mod config;
pub mod errors;

// Re-export main types
pub use ca::{
    AuthorizationDecision, AuthorizationResolver, CAConfig, CAMetrics, CAMetricsSnapshot,
    CertificateIssuer, CertificateResolver, Group, IssuedCertificate, KeyAlgorithm,
    KeyPairGenerator, MembershipDirectory, PolicyConfig, RcgenKeyPairGenerator,
    ReplicationConfig, ReplicationCoordinator, ReplicationReport, RevocationManager,
    RevocationOutcome, StaticMembershipDirectory,
};
pub use audit::{AccessDecision, AccessLog, SubjectName};
pub use config::GroupCaConfig;
pub use errors::{GroupCaError, Result};
pub use sinks::{BackupSink, NotificationSink};
pub use store::{CertificateStore, RevocationLedger};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use ca::SubjectLocks;
use config::StorageBackend;
use errors::ConfigError;
use sinks::{DirectoryBackupSink, FileNotificationSink, LogNotificationSink};
use store::{
    FileCertificateStore, FileRevocationLedger, MemoryCertificateStore, MemoryRevocationLedger,
    REVOCATION_LIST_FILE,
};

/// Collaborators a [`GroupCA`] is assembled from
pub struct GroupCaComponents {
    pub store: Arc<dyn CertificateStore>,
    pub ledger: Arc<dyn RevocationLedger>,
    pub directory: Arc<dyn MembershipDirectory>,
    pub backup: Option<Arc<dyn BackupSink>>,
    pub notifications: Arc<dyn NotificationSink>,
    pub key_generator: Arc<dyn KeyPairGenerator>,
}

impl GroupCaComponents {
    /// Build the collaborators a configuration describes
    pub async fn from_config(config: &GroupCaConfig) -> Result<Self> {
        let (store, ledger): (Arc<dyn CertificateStore>, Arc<dyn RevocationLedger>) =
            match config.storage.backend {
                StorageBackend::Memory => (
                    Arc::new(MemoryCertificateStore::new()),
                    Arc::new(MemoryRevocationLedger::new()),
                ),
                StorageBackend::File => {
                    let data_dir = Path::new(&config.storage.data_dir);
                    let store = FileCertificateStore::open(data_dir).await?;
                    let ledger =
                        FileRevocationLedger::open(data_dir.join(REVOCATION_LIST_FILE)).await?;
                    (Arc::new(store), Arc::new(ledger))
                }
            };

        let backup: Option<Arc<dyn BackupSink>> = match &config.replication.backup_dir {
            Some(dir) => Some(Arc::new(DirectoryBackupSink::new(dir).await?)),
            None => None,
        };

        let notifications: Arc<dyn NotificationSink> = match &config.notifications.journal_path {
            Some(path) => Arc::new(FileNotificationSink::new(path)),
            None => Arc::new(LogNotificationSink),
        };

        Ok(Self {
            store,
            ledger,
            directory: Arc::new(StaticMembershipDirectory::new(&config.policy.memberships)),
            backup,
            notifications,
            key_generator: Arc::new(RcgenKeyPairGenerator::new(config.ca.key_algorithm)),
        })
    }
}

/// Main GroupCA service coordinator
pub struct GroupCA {
    authorization: AuthorizationResolver,
    issuer: Arc<CertificateIssuer>,
    resolver: CertificateResolver,
    revocation: RevocationManager,
    replication: Arc<ReplicationCoordinator>,
    store: Arc<dyn CertificateStore>,
    access_log: Option<AccessLog>,
    metrics: Arc<CAMetrics>,
    config: Arc<GroupCaConfig>,
}

impl GroupCA {
    /// Validate `config` and build a CA with the collaborators it describes
    pub async fn new(config: GroupCaConfig) -> Result<Self> {
        config.validate()?;
        let components = GroupCaComponents::from_config(&config).await?;
        Ok(Self::with_components(config, components))
    }

    /// Build a CA around explicitly supplied collaborators
    pub fn with_components(config: GroupCaConfig, components: GroupCaComponents) -> Self {
        info!("Initializing GroupCA: {}", config.ca.ca_id);

        let metrics = Arc::new(CAMetrics::default());
        let locks = Arc::new(SubjectLocks::new());

        let replication = Arc::new(ReplicationCoordinator::new(
            components.store.clone(),
            components.ledger.clone(),
            components.backup,
            config.replication.clone(),
            metrics.clone(),
        ));
        if !replication.is_active() {
            warn!("Replication inactive: no backup sink configured or replication disabled");
        }

        let issuer = Arc::new(CertificateIssuer::new(
            components.store.clone(),
            components.key_generator,
            replication.clone(),
            locks.clone(),
            config.ca.clone(),
            metrics.clone(),
        ));
        let resolver =
            CertificateResolver::new(components.store.clone(), components.ledger.clone());
        let revocation = RevocationManager::new(
            components.ledger,
            issuer.clone(),
            resolver.clone(),
            components.notifications,
            config.notifications.timeout,
            replication.clone(),
            locks,
            metrics.clone(),
        );
        let authorization =
            AuthorizationResolver::new(config.policy.allowed_groups.clone(), components.directory);
        let access_log = config
            .audit
            .access_log_path
            .as_ref()
            .map(|path| AccessLog::new(path, config.policy.allowed_groups.clone()));

        info!(
            "GroupCA ready: policy {:?}",
            config.policy.allowed_groups.iter().map(Group::as_str).collect::<Vec<_>>()
        );

        Self {
            authorization,
            issuer,
            resolver,
            revocation,
            replication,
            store: components.store,
            access_log,
            metrics,
            config: Arc::new(config),
        }
    }

    /// Authorize `identity` and issue it a certificate for its group.
    /// Denial is `Ok(false)`, never an error.
    pub async fn request_certificate(&self, identity: &str) -> Result<bool> {
        match self.issue_for_identity(identity).await {
            Ok(_) => Ok(true),
            Err(GroupCaError::Unauthorized { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Authorize `identity` and return the issued certificate with its
    /// private key
    pub async fn issue_for_identity(&self, identity: &str) -> Result<IssuedCertificate> {
        let decision = self.authorization.resolve(identity);
        let group = match decision.into_result(identity) {
            Ok(group) => group,
            Err(e) => {
                CAMetrics::incr(&self.metrics.authorization_denials);
                return Err(e);
            }
        };
        self.issuer.issue(identity, Some(group), true).await
    }

    /// Administrative issuance without authorization; the certificate has no OU
    pub async fn create_certificate(
        &self,
        subject: &str,
        include_private_key: bool,
    ) -> Result<IssuedCertificate> {
        self.issuer.issue(subject, None, include_private_key).await
    }

    pub async fn revoke_certificate(&self, serial: &str) -> Result<RevocationOutcome> {
        self.revocation.revoke(serial).await
    }

    /// Whether `serial` names an issued, unrevoked certificate inside its
    /// validity window
    pub async fn validate(&self, serial: &str) -> Result<bool> {
        self.resolver.validate(serial).await
    }

    pub async fn current_certificate(&self, subject: &str) -> Result<Option<IssuedCertificate>> {
        self.resolver.current_valid(subject).await
    }

    /// Every issued certificate keyed by storage key
    pub async fn certificates(&self) -> Result<BTreeMap<String, Vec<IssuedCertificate>>> {
        self.store.snapshot().await
    }

    /// Re-run revocation handling when the subject's latest certificate has
    /// been revoked. `None` when there is nothing to do.
    pub async fn check_subject(&self, subject: &str) -> Result<Option<RevocationOutcome>> {
        let Some(latest) = self.resolver.latest_issued(subject).await? else {
            return Err(GroupCaError::NotFound {
                identifier: subject.to_string(),
            });
        };

        if !self.resolver.is_revoked(&latest.serial_number).await? {
            info!("Certificate SN={} of {} is not revoked", latest.serial_number, subject);
            return Ok(None);
        }

        warn!(
            "Certificate SN={} of {} is revoked, requesting replacement",
            latest.serial_number, subject
        );
        self.revoke_certificate(&latest.serial_number).await.map(Some)
    }

    /// Journal a client presenting a DER-encoded certificate
    pub async fn record_access(&self, certificate_der: &[u8]) -> Result<AccessDecision> {
        let access_log = self.access_log.as_ref().ok_or_else(|| ConfigError::ValidationFailed {
            field: "audit.access_log_path".to_string(),
            reason: "access journal not configured".to_string(),
        })?;
        access_log.record_certificate(certificate_der).await
    }

    /// Push the full state to the backup sink now
    pub async fn sync_backup(&self) -> ReplicationReport {
        self.replication.sync_all().await
    }

    pub fn metrics(&self) -> CAMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &GroupCaConfig {
        &self.config
    }
}
