//! GroupCA Configuration Management
//!
//! Central configuration for the CA: issuance parameters, storage backend,
//! replication target, authorization policy, journals and logging.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use crate::ca::{CAConfig, PolicyConfig, ReplicationConfig};
use crate::errors::{ConfigError, Result as GroupCaResult};

/// Main GroupCA configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupCaConfig {
    /// Certificate Authority configuration
    pub ca: CAConfig,
    /// Certificate and revocation storage
    pub storage: StorageConfig,
    /// Backup replication
    pub replication: ReplicationConfig,
    /// Authorization policy
    pub policy: PolicyConfig,
    /// Revocation notifications
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Access journal
    #[serde(default)]
    pub audit: AuditConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory holding per-subject files and the revocation list
    pub data_dir: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "file")]
    File,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: "/tmp/groupca".to_string(),
        }
    }
}

/// Revocation notification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Journal file for revocation notices; notices are only logged when unset
    pub journal_path: Option<String>,
    /// Upper bound for delivering one notice
    #[serde(default = "default_notify_timeout")]
    pub timeout: Duration,
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            timeout: default_notify_timeout(),
        }
    }
}

/// Access journal configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Access journal file; access is not journaled when unset
    pub access_log_path: Option<String>,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log output destination
    pub output: LogOutput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "trace")]
    Trace,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "pretty")]
    Pretty,
    #[serde(rename = "compact")]
    Compact,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOutput {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
    #[serde(rename = "file")]
    File { path: String },
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            output: LogOutput::Stderr,
        }
    }
}

impl Default for GroupCaConfig {
    fn default() -> Self {
        Self::localhost_testing()
    }
}

impl GroupCaConfig {
    /// In-memory configuration for localhost testing, no backup
    pub fn localhost_testing() -> Self {
        Self {
            ca: CAConfig::default(),
            storage: StorageConfig::default(),
            replication: ReplicationConfig::default(),
            policy: PolicyConfig::default(),
            notifications: NotificationConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// File-backed configuration for production deployment
    pub fn production() -> Self {
        Self {
            ca: CAConfig {
                ca_id: "groupca-production".to_string(),
                ..CAConfig::default()
            },
            storage: StorageConfig {
                backend: StorageBackend::File,
                data_dir: "/var/lib/groupca/certificates".to_string(),
            },
            replication: ReplicationConfig {
                enabled: true,
                backup_dir: Some("/var/lib/groupca/backup".to_string()),
                push_timeout: Duration::from_secs(10),
                include_private_keys: false,
            },
            policy: PolicyConfig::default(),
            notifications: NotificationConfig {
                journal_path: Some("/var/lib/groupca/RevocationNotifications.txt".to_string()),
                timeout: Duration::from_secs(10),
            },
            audit: AuditConfig {
                access_log_path: Some("/var/lib/groupca/Log.txt".to_string()),
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                format: LogFormat::Json,
                output: LogOutput::File {
                    path: "/var/log/groupca/groupca.log".to_string(),
                },
            },
        }
    }

    /// Load configuration from a `.toml`, `.yaml`/`.yml` or `.json` file
    pub fn from_file(path: &str) -> GroupCaResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_string(),
        })?;

        let parse_error = |format: &str, e: &dyn std::fmt::Display| ConfigError::ParseError {
            format: format.to_string(),
            reason: e.to_string(),
        };

        let config: Self = match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => toml::from_str(&contents).map_err(|e| parse_error("toml", &e))?,
            ConfigFormat::Yaml => {
                serde_yaml::from_str(&contents).map_err(|e| parse_error("yaml", &e))?
            }
            ConfigFormat::Json => {
                serde_json::from_str(&contents).map_err(|e| parse_error("json", &e))?
            }
        };
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file(&self, path: &str) -> GroupCaResult<()> {
        let serialize_error = |format: &str, e: &dyn std::fmt::Display| ConfigError::ParseError {
            format: format.to_string(),
            reason: format!("serialization failed: {}", e),
        };

        let contents = match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| serialize_error("toml", &e))?
            }
            ConfigFormat::Yaml => {
                serde_yaml::to_string(self).map_err(|e| serialize_error("yaml", &e))?
            }
            ConfigFormat::Json => {
                serde_json::to_string_pretty(self).map_err(|e| serialize_error("json", &e))?
            }
        };

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> GroupCaResult<()> {
        if self.ca.ca_id.trim().is_empty() {
            return Err(invalid("ca.ca_id", "must not be empty"));
        }
        if self.ca.cert_validity_days == 0 {
            return Err(invalid("ca.cert_validity_days", "must be positive"));
        }

        if self.policy.allowed_groups.is_empty() {
            return Err(invalid("policy.allowed_groups", "at least one group is required"));
        }
        let mut seen = HashSet::new();
        for group in &self.policy.allowed_groups {
            if !seen.insert(group) {
                return Err(invalid(
                    "policy.allowed_groups",
                    &format!("{} listed more than once", group),
                ));
            }
        }

        if self.storage.backend == StorageBackend::File && self.storage.data_dir.trim().is_empty() {
            return Err(invalid("storage.data_dir", "required for file storage"));
        }

        if self.replication.push_timeout.is_zero() {
            return Err(invalid("replication.push_timeout", "must be non-zero"));
        }
        if self.notifications.timeout.is_zero() {
            return Err(invalid("notifications.timeout", "must be non-zero"));
        }
        if let Some(backup_dir) = &self.replication.backup_dir {
            if self.storage.backend == StorageBackend::File
                && Path::new(backup_dir) == Path::new(&self.storage.data_dir)
            {
                return Err(invalid(
                    "replication.backup_dir",
                    "must differ from storage.data_dir",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::errors::GroupCaError {
    ConfigError::ValidationFailed {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &str) -> GroupCaResult<Self> {
        if path.ends_with(".toml") {
            Ok(ConfigFormat::Toml)
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            Ok(ConfigFormat::Yaml)
        } else if path.ends_with(".json") {
            Ok(ConfigFormat::Json)
        } else {
            Err(ConfigError::UnsupportedFormat {
                path: path.to_string(),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::Group;
    use crate::errors::GroupCaError;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = GroupCaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.replication.backup_dir.is_none());
    }

    #[test]
    fn test_production_config() {
        let config = GroupCaConfig::production();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = GroupCaConfig::production();
        config.policy.allowed_groups = vec![Group::RegionSouth, Group::RegionEast];
        config
            .policy
            .memberships
            .insert("CORP\\alice".to_string(), vec!["RegionEast".to_string()]);

        for name in ["groupca.toml", "groupca.yaml", "groupca.json"] {
            let path = temp_dir.path().join(name);
            let path = path.to_str().unwrap();
            config.to_file(path).unwrap();

            let loaded = GroupCaConfig::from_file(path).unwrap();
            assert_eq!(loaded.ca.ca_id, config.ca.ca_id);
            assert_eq!(loaded.policy.allowed_groups, config.policy.allowed_groups);
            assert_eq!(loaded.policy.memberships, config.policy.memberships);
            assert_eq!(loaded.replication.push_timeout, config.replication.push_timeout);
            assert_eq!(loaded.notifications.timeout, config.notifications.timeout);
            assert_eq!(loaded.logging.output, config.logging.output);
        }
    }

    #[test]
    fn test_unsupported_and_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let ini = temp_dir.path().join("groupca.ini");
        std::fs::write(&ini, "").unwrap();

        assert!(matches!(
            GroupCaConfig::from_file(ini.to_str().unwrap()).unwrap_err(),
            GroupCaError::Configuration(ConfigError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            GroupCaConfig::from_file("/nonexistent/groupca.toml").unwrap_err(),
            GroupCaError::Configuration(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_policy_validation() {
        let mut config = GroupCaConfig::localhost_testing();
        config.policy.allowed_groups.clear();
        assert!(config.validate().is_err());

        config.policy.allowed_groups = vec![Group::RegionWest, Group::RegionWest];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_numeric_validation() {
        let mut config = GroupCaConfig::localhost_testing();
        config.ca.cert_validity_days = 0;
        assert!(config.validate().is_err());

        let mut config = GroupCaConfig::localhost_testing();
        config.replication.push_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = GroupCaConfig::localhost_testing();
        config.notifications.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backup_dir_must_not_be_data_dir() {
        let mut config = GroupCaConfig::production();
        config.replication.backup_dir = Some(config.storage.data_dir.clone());
        assert!(config.validate().is_err());
    }
}
