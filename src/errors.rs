//! GroupCA Error Types
//!
//! Tagged error handling for the certificate authority core. Expected outcomes
//! (unauthorized callers, unknown serials) and fatal faults (storage failures)
//! are distinct variants so callers can tell them apart without string matching.

use thiserror::Error;
use serde::{Serialize, Deserialize};

/// Main GroupCA error type
#[derive(Debug, Error)]
pub enum GroupCaError {
    /// Caller is not a member of any allowed policy group
    #[error("Unauthorized: {identity} is not a member of an allowed group")]
    Unauthorized { identity: String },

    /// Serial or subject absent from the store
    #[error("Not found: {identifier}")]
    NotFound { identifier: String },

    /// Subject is empty or sanitizes to an empty storage key
    #[error("Invalid subject: {subject:?} - {reason}")]
    InvalidSubject { subject: String, reason: String },

    /// Durable write or read failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Best-effort backup push failed
    #[error("Replication failed: {reason}")]
    Replication { reason: String },

    /// Key generation or certificate encoding failed
    #[error("Cryptographic error: {0}")]
    Cryptographic(#[from] CryptoError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation exceeded its time budget
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage specific errors
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum StorageError {
    #[error("File system error: {path} - {reason}")]
    FileSystem { path: String, reason: String },

    #[error("Duplicate serial number: {serial}")]
    DuplicateSerial { serial: String },

    #[error("Data corruption detected: {location} - {reason}")]
    DataCorruption { location: String, reason: String },

    #[error("Backup operation failed: {reason}")]
    BackupFailed { reason: String },
}

/// Cryptographic specific errors
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum CryptoError {
    #[error("Key generation failed: {algorithm} - {reason}")]
    KeyGeneration { algorithm: String, reason: String },

    #[error("Certificate generation failed: {reason}")]
    CertificateGeneration { reason: String },

    #[error("Certificate parsing failed: {reason}")]
    CertificateParsing { reason: String },
}

/// Configuration specific errors
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parse error: {format} - {reason}")]
    ParseError { format: String, reason: String },

    #[error("Configuration validation failed: {field} - {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("Unsupported configuration format: {path}")]
    UnsupportedFormat { path: String },
}

/// Result type for GroupCA operations
pub type Result<T> = std::result::Result<T, GroupCaError>;

/// Machine-readable error report printed by the command line
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorResponse {
    pub fn new(error: &GroupCaError) -> Self {
        Self {
            error: error.to_string(),
            code: Self::error_code(error).to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn error_code(error: &GroupCaError) -> &'static str {
        match error {
            GroupCaError::Unauthorized { .. } => "CA_UNAUTHORIZED",
            GroupCaError::NotFound { .. } => "CA_NOT_FOUND",
            GroupCaError::InvalidSubject { .. } => "CA_INVALID_SUBJECT",
            GroupCaError::Storage(e) => match e {
                StorageError::DuplicateSerial { .. } => "STORAGE_DUPLICATE_SERIAL",
                StorageError::DataCorruption { .. } => "STORAGE_CORRUPTION",
                _ => "STORAGE_ERROR",
            },
            GroupCaError::Replication { .. } => "REPLICATION_ERROR",
            GroupCaError::Cryptographic(_) => "CRYPTO_ERROR",
            GroupCaError::Configuration(_) => "CONFIG_ERROR",
            GroupCaError::Timeout { .. } => "TIMEOUT_ERROR",
            GroupCaError::Internal { .. } => "INTERNAL_ERROR",
            _ => "UNKNOWN_ERROR",
        }
    }
}

/// Convert serde_json::Error to GroupCaError
impl From<serde_json::Error> for GroupCaError {
    fn from(error: serde_json::Error) -> Self {
        GroupCaError::Serialization(error.to_string())
    }
}
