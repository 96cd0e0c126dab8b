//! Revoke-then-reissue
//!
//! Revoking a serial appends it to the ledger, notifies downstream consumers
//! and issues a replacement for the same subject and group, all under the
//! subject lock. Replacements carry their private key so the subject can pick
//! them up. Replication runs once, after the lock is released.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::Result as GroupCaResult;
use crate::sinks::NotificationSink;
use crate::store::{storage_key, RevocationLedger};
use super::{
    normalize_serial, CAMetrics, CertificateIssuer, CertificateResolver, IssuedCertificate,
    ReplicationCoordinator, SubjectLocks,
};

/// What a revocation request did
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationOutcome {
    /// Serial newly revoked and a replacement issued
    Revoked {
        revoked: IssuedCertificate,
        replacement: IssuedCertificate,
    },
    /// Serial was already revoked. A replacement is issued only when the
    /// subject had no usable certificate left.
    AlreadyRevoked {
        serial: String,
        replacement: Option<IssuedCertificate>,
    },
    /// No certificate with this serial was ever issued; nothing changed
    UnknownSerial { serial: String },
}

impl RevocationOutcome {
    pub fn replacement(&self) -> Option<&IssuedCertificate> {
        match self {
            RevocationOutcome::Revoked { replacement, .. } => Some(replacement),
            RevocationOutcome::AlreadyRevoked { replacement, .. } => replacement.as_ref(),
            RevocationOutcome::UnknownSerial { .. } => None,
        }
    }
}

/// Coordinates the ledger, notifications and re-issuance
pub struct RevocationManager {
    ledger: Arc<dyn RevocationLedger>,
    issuer: Arc<CertificateIssuer>,
    resolver: CertificateResolver,
    notifications: Arc<dyn NotificationSink>,
    notify_timeout: Duration,
    replication: Arc<ReplicationCoordinator>,
    locks: Arc<SubjectLocks>,
    metrics: Arc<CAMetrics>,
}

impl RevocationManager {
    pub fn new(
        ledger: Arc<dyn RevocationLedger>,
        issuer: Arc<CertificateIssuer>,
        resolver: CertificateResolver,
        notifications: Arc<dyn NotificationSink>,
        notify_timeout: Duration,
        replication: Arc<ReplicationCoordinator>,
        locks: Arc<SubjectLocks>,
        metrics: Arc<CAMetrics>,
    ) -> Self {
        Self {
            ledger,
            issuer,
            resolver,
            notifications,
            notify_timeout,
            replication,
            locks,
            metrics,
        }
    }

    /// Revoke `serial` and issue a replacement for its subject
    pub async fn revoke(&self, serial: &str) -> GroupCaResult<RevocationOutcome> {
        let serial = normalize_serial(serial);
        let operation_id = Uuid::new_v4();
        info!(operation = %operation_id, "Revocation requested for SN={}", serial);

        let Some(revoked) = self.resolver.find_by_serial(&serial).await? else {
            warn!(operation = %operation_id, "Revocation ignored: SN={} was never issued", serial);
            return Ok(RevocationOutcome::UnknownSerial { serial });
        };

        let key = storage_key(&revoked.subject)?;
        let outcome = {
            let _guard = self.locks.lock(&key).await;
            self.revoke_locked(&key, revoked, operation_id).await
        };

        // Replicate whatever reached durable state, including a ledger append
        // whose re-issuance failed
        self.replication.sync_all().await;
        outcome
    }

    async fn revoke_locked(
        &self,
        key: &str,
        revoked: IssuedCertificate,
        operation_id: Uuid,
    ) -> GroupCaResult<RevocationOutcome> {
        let serial = revoked.serial_number.clone();

        if !self.ledger.append(&serial).await? {
            if self.resolver.current_valid(&revoked.subject).await?.is_some() {
                info!(operation = %operation_id, "SN={} already revoked", serial);
                return Ok(RevocationOutcome::AlreadyRevoked {
                    serial,
                    replacement: None,
                });
            }

            warn!(
                operation = %operation_id,
                "SN={} already revoked and {} has no usable certificate, reissuing",
                serial, revoked.subject
            );
            let replacement = self
                .issuer
                .issue_locked(key, &revoked.subject, revoked.group, true)
                .await?;
            return Ok(RevocationOutcome::AlreadyRevoked {
                serial,
                replacement: Some(replacement),
            });
        }

        CAMetrics::incr(&self.metrics.revocations);
        info!(operation = %operation_id, "Certificate revoked: SN={} ({})", serial, revoked.subject);

        let notice = self.notifications.notify_revoked(&serial);
        match tokio::time::timeout(self.notify_timeout, notice).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(operation = %operation_id, "Revocation notice for SN={} failed: {}", serial, e);
            }
            Err(_) => {
                warn!(
                    operation = %operation_id,
                    "Revocation notice for SN={} abandoned after {:?}",
                    serial, self.notify_timeout
                );
            }
        }

        let replacement = self
            .issuer
            .issue_locked(key, &revoked.subject, revoked.group, true)
            .await?;
        info!(
            operation = %operation_id,
            "Replacement issued for {}: SN={}",
            revoked.subject, replacement.serial_number
        );

        Ok(RevocationOutcome::Revoked {
            revoked,
            replacement,
        })
    }
}
