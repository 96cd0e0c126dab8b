//! Access journal for authenticated client communication
//!
//! A presenting client's certificate is reduced to its CN and OU. Clients
//! whose OU is an allowed policy group get a numbered, timestamped line in the
//! journal; everything else is refused without touching the file.

use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use x509_parser::parse_x509_certificate;

use crate::ca::Group;
use crate::errors::{CryptoError, StorageError, Result as GroupCaResult};
use crate::sinks::notify::JOURNAL_TIMESTAMP_FORMAT;

/// Outcome of presenting a certificate to the access journal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessDecision {
    Recorded { entry_id: usize, line: String },
    Refused { reason: String },
}

/// CN and OU pulled out of a subject name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectName {
    pub common_name: Option<String>,
    pub organizational_unit: Option<String>,
}

impl SubjectName {
    /// Read the subject of a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> GroupCaResult<Self> {
        let (_, cert) = parse_x509_certificate(der).map_err(|e| CryptoError::CertificateParsing {
            reason: e.to_string(),
        })?;
        let subject = cert.subject();
        let name = SubjectName {
            common_name: subject
                .iter_common_name()
                .next()
                .and_then(|attr| attr.as_str().ok())
                .map(str::to_string),
            organizational_unit: subject
                .iter_organizational_unit()
                .next()
                .and_then(|attr| attr.as_str().ok())
                .map(str::to_string),
        };
        Ok(name)
    }

    /// Read the subject of a PEM-encoded certificate
    pub fn from_pem(pem: &str) -> GroupCaResult<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).map_err(|e| {
            CryptoError::CertificateParsing {
                reason: e.to_string(),
            }
        })?;
        Self::from_der(&pem.contents)
    }
}

/// Numbered journal of clients that communicated with an allowed group
pub struct AccessLog {
    path: PathBuf,
    allowed_groups: Vec<Group>,
    write_lock: Mutex<()>,
}

impl AccessLog {
    pub fn new(path: impl AsRef<Path>, allowed_groups: Vec<Group>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            allowed_groups,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Journal the holder of a DER-encoded certificate
    pub async fn record_certificate(&self, der: &[u8]) -> GroupCaResult<AccessDecision> {
        let name = SubjectName::from_der(der)?;
        self.record(name).await
    }

    /// Journal the holder of a PEM-encoded certificate
    pub async fn record_pem(&self, pem: &str) -> GroupCaResult<AccessDecision> {
        let name = SubjectName::from_pem(pem)?;
        self.record(name).await
    }

    pub async fn record(&self, name: SubjectName) -> GroupCaResult<AccessDecision> {
        let (Some(cn), Some(ou)) = (
            name.common_name.filter(|cn| !cn.trim().is_empty()),
            name.organizational_unit.filter(|ou| !ou.trim().is_empty()),
        ) else {
            warn!("Access refused: certificate subject lacks CN or OU");
            return Ok(AccessDecision::Refused {
                reason: "missing CN or OU".to_string(),
            });
        };

        let allowed = ou
            .parse::<Group>()
            .map(|group| self.allowed_groups.contains(&group))
            .unwrap_or(false);
        if !allowed {
            warn!("Access refused: {} is not in an allowed group (OU={})", cn, ou);
            return Ok(AccessDecision::Refused {
                reason: format!("OU={} is not an allowed group", ou),
            });
        }

        let _guard = self.write_lock.lock().await;
        let fs_error = |e: std::io::Error| StorageError::FileSystem {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(fs_error)?;
        }
        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents.lines().count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(fs_error(e).into()),
        };

        let entry_id = existing + 1;
        let line = format!(
            "{}:{};{}",
            entry_id,
            chrono::Local::now().format(JOURNAL_TIMESTAMP_FORMAT),
            cn
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(fs_error)?;
        file.write_all(format!("{}\n", line).as_bytes()).await.map_err(fs_error)?;
        file.flush().await.map_err(fs_error)?;

        info!("Access recorded: {}", line);
        Ok(AccessDecision::Recorded { entry_id, line })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use tempfile::TempDir;

    fn certificate_der(cn: &str, ou: Option<&str>) -> (Vec<u8>, String) {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        if let Some(ou) = ou {
            dn.push(DnType::OrganizationalUnitName, ou);
        }
        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.der().to_vec(), cert.pem())
    }

    #[test]
    fn test_subject_name_from_certificate() {
        let (der, pem) = certificate_der("CORP\\alice", Some("RegionEast"));
        let name = SubjectName::from_der(&der).unwrap();
        assert_eq!(name.common_name.as_deref(), Some("CORP\\alice"));
        assert_eq!(name.organizational_unit.as_deref(), Some("RegionEast"));
        assert_eq!(SubjectName::from_pem(&pem).unwrap(), name);

        let (no_ou, _) = certificate_der("svc", None);
        assert_eq!(SubjectName::from_der(&no_ou).unwrap().organizational_unit, None);
    }

    #[tokio::test]
    async fn test_allowed_group_is_journaled_with_increasing_ids() {
        let temp_dir = TempDir::new().unwrap();
        let log = AccessLog::new(temp_dir.path().join("Log.txt"), Group::ALL.to_vec());

        let (der, pem) = certificate_der("alice", Some("RegionEast"));
        let first = log.record_certificate(&der).await.unwrap();
        let second = log.record_pem(&pem).await.unwrap();

        match (first, second) {
            (
                AccessDecision::Recorded { entry_id: 1, line: first_line },
                AccessDecision::Recorded { entry_id: 2, line: second_line },
            ) => {
                assert!(first_line.starts_with("1:"));
                assert!(first_line.ends_with(";alice"));
                assert!(second_line.starts_with("2:"));
            }
            other => panic!("unexpected decisions: {:?}", other),
        }

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_other_groups_are_refused_without_writing() {
        let temp_dir = TempDir::new().unwrap();
        let log = AccessLog::new(temp_dir.path().join("Log.txt"), vec![Group::RegionWest]);

        let (east, _) = certificate_der("alice", Some("RegionEast"));
        let (admin, _) = certificate_der("root", Some("Administrators"));
        let (no_ou, _) = certificate_der("svc", None);

        for der in [east, admin, no_ou] {
            let decision = log.record_certificate(&der).await.unwrap();
            assert!(matches!(decision, AccessDecision::Refused { .. }));
        }
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_garbage_certificate_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let log = AccessLog::new(temp_dir.path().join("Log.txt"), Group::ALL.to_vec());
        assert!(log.record_certificate(b"not a certificate").await.is_err());
    }
}
