//! External collaborators
//!
//! Capabilities the core calls out to after mutations: a backup receiver for
//! replicated state and a sink for revocation notices. Both are best-effort;
//! failures are logged by the caller and never undo local state.

use async_trait::async_trait;

use crate::errors::Result as GroupCaResult;

pub mod backup;
pub mod notify;

pub use backup::{DirectoryBackupSink, MemoryBackupSink};
pub use notify::{FileNotificationSink, LogNotificationSink, MemoryNotificationSink};

/// Receiver of whole-file backups
#[async_trait]
pub trait BackupSink: Send + Sync {
    async fn push(&self, file_name: &str, content: Vec<u8>) -> GroupCaResult<()>;
}

/// Downstream consumers of revocation events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_revoked(&self, serial: &str) -> GroupCaResult<()>;
}
