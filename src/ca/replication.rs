//! Replication of CA state to a backup sink
//!
//! After every issuance or revocation the full store and ledger are pushed as
//! whole files: one `<storage key>.json` per subject and the revocation list.
//! Pushes are best-effort. A failing or slow sink is logged and counted, and
//! never rolls back local state. One round, including the wait for an earlier
//! round to finish, is bounded by `push_timeout`; whatever a cut-short round
//! missed goes out with the next one since every round sends the full state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{GroupCaError, Result as GroupCaResult};
use crate::sinks::BackupSink;
use crate::store::{CertificateStore, RevocationLedger, REVOCATION_LIST_FILE};
use super::{CAMetrics, IssuedCertificate};

/// Replication configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Push to the backup sink after each mutation
    pub enabled: bool,
    /// Directory receiving backups; no sink is built when unset
    pub backup_dir: Option<String>,
    /// Upper bound for a whole replication round
    pub push_timeout: Duration,
    /// Replicate private keys stored at issuance
    pub include_private_keys: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_dir: None,
            push_timeout: Duration::from_secs(5),
            include_private_keys: false,
        }
    }
}

/// One whole file destined for the backup sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Consistent copy of everything replicated
#[derive(Clone, Debug, Default)]
pub struct BackupSnapshot {
    pub files: Vec<BackupFile>,
}

impl BackupSnapshot {
    pub fn file(&self, name: &str) -> Option<&BackupFile> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// Result of one replication round
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    /// Files the sink accepted
    pub files_pushed: usize,
    /// Every file of the round was accepted
    pub succeeded: bool,
    /// No sink configured or replication disabled
    pub skipped: bool,
}

/// Pushes CA state to the configured backup sink
pub struct ReplicationCoordinator {
    store: Arc<dyn CertificateStore>,
    ledger: Arc<dyn RevocationLedger>,
    sink: Option<Arc<dyn BackupSink>>,
    config: ReplicationConfig,
    push_lock: Mutex<()>,
    metrics: Arc<CAMetrics>,
}

impl ReplicationCoordinator {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        ledger: Arc<dyn RevocationLedger>,
        sink: Option<Arc<dyn BackupSink>>,
        config: ReplicationConfig,
        metrics: Arc<CAMetrics>,
    ) -> Self {
        Self {
            store,
            ledger,
            sink,
            config,
            push_lock: Mutex::new(()),
            metrics,
        }
    }

    pub fn is_active(&self) -> bool {
        self.config.enabled && self.sink.is_some()
    }

    /// Serialize the store and ledger. The store is read before the ledger, so
    /// a serial in the revocation list always has its certificate in the store
    /// files of the same or a later snapshot.
    pub async fn build_snapshot(&self) -> GroupCaResult<BackupSnapshot> {
        let certificates = self.store.snapshot().await?;
        let revoked = self.ledger.all_revoked().await?;

        let mut files = Vec::with_capacity(certificates.len() + 1);
        for (key, sequence) in certificates {
            let sequence: Vec<IssuedCertificate> = if self.config.include_private_keys {
                sequence
            } else {
                sequence.iter().map(IssuedCertificate::without_private_key).collect()
            };
            let bytes = serde_json::to_vec_pretty(&sequence)?;
            files.push(BackupFile {
                name: format!("{}.json", key),
                bytes,
            });
        }

        let mut revocation_list = String::new();
        for serial in revoked {
            revocation_list.push_str(&serial);
            revocation_list.push('\n');
        }
        files.push(BackupFile {
            name: REVOCATION_LIST_FILE.to_string(),
            bytes: revocation_list.into_bytes(),
        });

        Ok(BackupSnapshot { files })
    }

    /// Replicate the current state. Failures, a timed-out round included, are
    /// logged and reported, never returned.
    pub async fn sync_all(&self) -> ReplicationReport {
        let Some(sink) = self.sink.as_ref().filter(|_| self.config.enabled) else {
            debug!("Replication skipped: no active backup sink");
            return ReplicationReport {
                files_pushed: 0,
                succeeded: true,
                skipped: true,
            };
        };

        let budget = self.config.push_timeout;
        match tokio::time::timeout(budget, self.push_round(sink.as_ref())).await {
            Ok(report) => report,
            Err(_) => {
                let e = GroupCaError::Timeout {
                    operation: "replication round".to_string(),
                    duration: budget,
                };
                warn!("Replication abandoned: {}", e);
                CAMetrics::incr(&self.metrics.replication_failures);
                ReplicationReport::default()
            }
        }
    }

    async fn push_round(&self, sink: &dyn BackupSink) -> ReplicationReport {
        // Concurrent rounds would interleave file versions at the sink
        let _guard = self.push_lock.lock().await;

        let snapshot = match self.build_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Replication snapshot failed: {}", e);
                CAMetrics::incr(&self.metrics.replication_failures);
                return ReplicationReport::default();
            }
        };

        let mut report = ReplicationReport {
            files_pushed: 0,
            succeeded: true,
            skipped: false,
        };
        for file in snapshot.files {
            match sink.push(&file.name, file.bytes).await {
                Ok(()) => {
                    report.files_pushed += 1;
                    CAMetrics::incr(&self.metrics.replication_pushes);
                }
                Err(e) => {
                    warn!("Backup push of {} failed: {}", file.name, e);
                    CAMetrics::incr(&self.metrics.replication_failures);
                    report.succeeded = false;
                }
            }
        }

        info!(
            "Replication round complete: {} files pushed{}",
            report.files_pushed,
            if report.succeeded { "" } else { " (with failures)" }
        );
        report
    }
}
