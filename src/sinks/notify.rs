//! Revocation notification sinks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::{StorageError, Result as GroupCaResult};
use super::NotificationSink;

/// Timestamp layout used in notification and access journals
pub const JOURNAL_TIMESTAMP_FORMAT: &str = "%d.%m.%Y. %H:%M:%S";

fn revocation_message(serial: &str) -> String {
    format!("Revocation notice sent for certificate SN={}.", serial)
}

/// Emits a tracing event per revocation
#[derive(Clone, Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify_revoked(&self, serial: &str) -> GroupCaResult<()> {
        info!(serial = %serial, "{}", revocation_message(serial));
        Ok(())
    }
}

/// Appends a timestamped line per revocation to a journal file
pub struct FileNotificationSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileNotificationSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl NotificationSink for FileNotificationSink {
    async fn notify_revoked(&self, serial: &str) -> GroupCaResult<()> {
        let message = revocation_message(serial);
        let line = format!(
            "{} - {}\n",
            chrono::Local::now().format(JOURNAL_TIMESTAMP_FORMAT),
            message
        );

        let _guard = self.write_lock.lock().await;
        let fs_error = |e: std::io::Error| StorageError::FileSystem {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(fs_error)?;
        file.write_all(line.as_bytes()).await.map_err(fs_error)?;
        file.flush().await.map_err(fs_error)?;

        info!("{}", message);
        Ok(())
    }
}

/// Records notified serials in memory
#[derive(Default)]
pub struct MemoryNotificationSink {
    notified: Mutex<Vec<String>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notified(&self) -> Vec<String> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify_revoked(&self, serial: &str) -> GroupCaResult<()> {
        self.notified.lock().await.push(serial.to_string());
        Ok(())
    }
}
