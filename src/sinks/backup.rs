//! Backup receivers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::errors::{StorageError, Result as GroupCaResult};
use crate::store::file::write_atomic;
use super::BackupSink;

/// Writes every pushed file into a backup directory, replacing any previous
/// copy with the same name.
pub struct DirectoryBackupSink {
    root: PathBuf,
}

impl DirectoryBackupSink {
    pub async fn new(root: impl AsRef<Path>) -> GroupCaResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::BackupFailed {
                reason: format!("{}: {}", root.display(), e),
            })?;
        info!("Backup directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BackupSink for DirectoryBackupSink {
    async fn push(&self, file_name: &str, content: Vec<u8>) -> GroupCaResult<()> {
        let is_plain_name = Path::new(file_name)
            .file_name()
            .map(|name| name == file_name)
            .unwrap_or(false);
        if !is_plain_name {
            return Err(StorageError::BackupFailed {
                reason: format!("refusing backup file name {:?}", file_name),
            }
            .into());
        }

        let path = self.root.join(file_name);
        write_atomic(&path, &content)
            .await
            .map_err(|e| StorageError::BackupFailed { reason: e.to_string() })?;
        debug!("Backup written: {} ({} bytes)", file_name, content.len());
        Ok(())
    }
}

/// Keeps the latest copy of every pushed file in memory
#[derive(Default)]
pub struct MemoryBackupSink {
    files: DashMap<String, Vec<u8>>,
    pushes: AtomicUsize,
}

impl MemoryBackupSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.get(name).map(|content| content.clone())
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Total number of `push` calls received
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BackupSink for MemoryBackupSink {
    async fn push(&self, file_name: &str, content: Vec<u8>) -> GroupCaResult<()> {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        self.files.insert(file_name.to_string(), content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_sink_overwrites_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let sink = DirectoryBackupSink::new(temp_dir.path().join("RealBackup")).await.unwrap();

        sink.push("alice.json", b"[1]".to_vec()).await.unwrap();
        sink.push("alice.json", b"[1,2]".to_vec()).await.unwrap();

        let written = std::fs::read(sink.root().join("alice.json")).unwrap();
        assert_eq!(written, b"[1,2]");
    }

    #[tokio::test]
    async fn test_directory_sink_rejects_paths() {
        let temp_dir = TempDir::new().unwrap();
        let sink = DirectoryBackupSink::new(temp_dir.path()).await.unwrap();

        assert!(sink.push("../escape.json", vec![1]).await.is_err());
        assert!(sink.push("nested/file.json", vec![1]).await.is_err());
    }
}
