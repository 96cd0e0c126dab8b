//! File-backed storage
//!
//! Certificates live in one JSON file per storage key (`<key>.json`, the
//! subject's full issuance history). The revocation ledger is an append-only
//! text file with one serial per line. Both are loaded into memory at open;
//! reads are served from memory, writes hit disk first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::ca::{normalize_serial, IssuedCertificate};
use crate::errors::{StorageError, Result as GroupCaResult};
use super::{CertificateStore, RevocationLedger};

/// File name of the revocation ledger inside the data directory
pub const REVOCATION_LIST_FILE: &str = "RevocationList.txt";

const CERTIFICATE_FILE_EXTENSION: &str = "json";

fn fs_error(path: &Path, error: impl ToString) -> StorageError {
    StorageError::FileSystem {
        path: path.display().to_string(),
        reason: error.to_string(),
    }
}

/// Write `bytes` to `path` through a synced temporary file and a rename, so
/// readers see either the old content or the new one.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp_path = path.with_extension("tmp");

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| fs_error(&tmp_path, e))?;
    file.write_all(bytes).await.map_err(|e| fs_error(&tmp_path, e))?;
    file.sync_all().await.map_err(|e| fs_error(&tmp_path, e))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| fs_error(path, e))
}

#[derive(Default)]
struct StoreState {
    by_key: HashMap<String, Vec<IssuedCertificate>>,
    serials: HashSet<String>,
}

/// Certificate store persisted as per-subject JSON files
pub struct FileCertificateStore {
    root: PathBuf,
    state: RwLock<StoreState>,
    /// Serializes writers; readers only wait for the final cache swap
    write_lock: Mutex<()>,
}

impl FileCertificateStore {
    /// Open (or create) a store rooted at `root`, loading existing files
    pub async fn open(root: impl AsRef<Path>) -> GroupCaResult<Self> {
        let root = root.as_ref().to_path_buf();
        info!("Opening certificate store: {}", root.display());

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| fs_error(&root, e))?;

        let mut state = StoreState::default();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| fs_error(&root, e))?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| fs_error(&root, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CERTIFICATE_FILE_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let bytes = tokio::fs::read(&path).await.map_err(|e| fs_error(&path, e))?;
            let certs: Vec<IssuedCertificate> = serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::DataCorruption {
                    location: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

            for cert in &certs {
                if !state.serials.insert(cert.serial_number.clone()) {
                    return Err(StorageError::DataCorruption {
                        location: path.display().to_string(),
                        reason: format!("duplicate serial {}", cert.serial_number),
                    }
                    .into());
                }
            }
            debug!("Loaded {} certificate(s) for {}", certs.len(), key);
            state.by_key.insert(key, certs);
        }

        info!(
            "Certificate store ready: {} subject(s), {} certificate(s)",
            state.by_key.len(),
            state.serials.len()
        );

        Ok(Self {
            root,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, CERTIFICATE_FILE_EXTENSION))
    }
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn insert(&self, key: &str, certificate: IssuedCertificate) -> GroupCaResult<()> {
        let _writer = self.write_lock.lock().await;

        let mut sequence = {
            let state = self.state.read().await;
            if state.serials.contains(&certificate.serial_number) {
                return Err(StorageError::DuplicateSerial {
                    serial: certificate.serial_number,
                }
                .into());
            }
            state.by_key.get(key).cloned().unwrap_or_default()
        };

        let serial = certificate.serial_number.clone();
        sequence.push(certificate);

        let path = self.path_for(key);
        let bytes = serde_json::to_vec_pretty(&sequence)?;
        write_atomic(&path, &bytes).await?;

        let mut state = self.state.write().await;
        state.serials.insert(serial);
        state.by_key.insert(key.to_string(), sequence);
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

/// Revocation ledger persisted as an append-only text file
pub struct FileRevocationLedger {
    path: PathBuf,
    state: RwLock<LedgerState>,
    /// Global append lock; held until the in-memory view is updated
    append_lock: Mutex<()>,
}

impl FileRevocationLedger {
    /// Open (or create) the ledger file, loading existing entries
    pub async fn open(path: impl AsRef<Path>) -> GroupCaResult<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening revocation ledger: {}", path.display());

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fs_error(parent, e))?;
        }

        let mut state = LedgerState::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines() {
                    let serial = normalize_serial(line);
                    if serial.is_empty() {
                        continue;
                    }
                    if state.members.insert(serial.clone()) {
                        state.order.push(serial);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| fs_error(&path, e))?;
            }
            Err(e) => return Err(fs_error(&path, e).into()),
        }

        info!("Revocation ledger ready: {} revoked serial(s)", state.order.len());
        Ok(Self {
            path,
            state: RwLock::new(state),
            append_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RevocationLedger for FileRevocationLedger {
    async fn append(&self, serial: &str) -> GroupCaResult<bool> {
        let serial = normalize_serial(serial);
        let _append = self.append_lock.lock().await;

        if self.state.read().await.members.contains(&serial) {
            return Ok(false);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| fs_error(&self.path, e))?;
        file.write_all(format!("{}\n", serial).as_bytes())
            .await
            .map_err(|e| fs_error(&self.path, e))?;
        file.sync_all().await.map_err(|e| fs_error(&self.path, e))?;

        let mut state = self.state.write().await;
        state.members.insert(serial.clone());
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
