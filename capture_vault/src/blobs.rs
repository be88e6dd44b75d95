//! Capture Vault - Blob Storage
//!
//! Flat store of encrypted capture blobs addressed by capture id.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{StorageError, StorageResult};

/// Blob file extension
const BLOB_EXT: &str = "enc";

/// Overwrite chunk for secure delete
const WIPE_CHUNK: usize = 1024 * 1024;

/// Encrypted blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Durably write (or replace) a blob
    async fn write(&self, capture_id: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Read a blob; `BlobNotFound` if absent
    async fn read(&self, capture_id: &str) -> StorageResult<Vec<u8>>;

    /// Delete a blob. Deleting an absent blob is not an error.
    async fn delete(&self, capture_id: &str) -> StorageResult<()>;

    /// Ids of every stored blob
    async fn list(&self) -> StorageResult<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Filesystem store
// ═══════════════════════════════════════════════════════════════════════════

/// Filesystem blob store: one `<capture_id>.enc` file per capture
pub struct FsBlobStore {
    /// Root directory
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub async fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)
            .await
            .map_err(|e| StorageError::Corrupted(format!("{}: {}", root.display(), e)))?;

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, capture_id: &str) -> StorageResult<PathBuf> {
        let valid = !capture_id.is_empty()
            && capture_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::BlobWriteFailed {
                capture_id: capture_id.to_string(),
                reason: "capture id is not a safe file name".into(),
            });
        }
        Ok(self.root.join(format!("{}.{}", capture_id, BLOB_EXT)))
    }

    /// Overwrite the file with zeros before unlinking it
    async fn wipe(path: &Path) -> std::io::Result<()> {
        let size = fs::metadata(path).await?.len() as usize;
        if size > 0 {
            let mut file = OpenOptions::new().write(true).open(path).await?;
            let zeros = vec![0u8; size.min(WIPE_CHUNK)];
            let mut remaining = size;
            while remaining > 0 {
                let to_write = remaining.min(zeros.len());
                file.write_all(&zeros[..to_write]).await?;
                remaining -= to_write;
            }
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write(&self, capture_id: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.blob_path(capture_id)?;
        let temp_path = path.with_extension("tmp");
        let failed = |e: std::io::Error| StorageError::BlobWriteFailed {
            capture_id: capture_id.to_string(),
            reason: e.to_string(),
        };

        // Temp file + fsync + rename so a crash never leaves a torn blob
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(failed)?;
        file.write_all(bytes).await.map_err(failed)?;
        file.sync_all().await.map_err(failed)?;
        drop(file);

        fs::rename(&temp_path, &path).await.map_err(failed)?;
        Ok(())
    }

    async fn read(&self, capture_id: &str) -> StorageResult<Vec<u8>> {
        let path = self
            .blob_path(capture_id)
            .map_err(|_| StorageError::BlobNotFound(capture_id.to_string()))?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::BlobNotFound(capture_id.to_string()))
            }
            Err(e) => Err(StorageError::BlobReadFailed {
                capture_id: capture_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn delete(&self, capture_id: &str) -> StorageResult<()> {
        let path = self.blob_path(capture_id)?;

        if let Err(e) = Self::wipe(&path).await {
            if e.kind() == ErrorKind::NotFound {
                return Ok(());
            }
            log::warn!("Could not wipe blob {} before delete: {}", capture_id, e);
        }

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::BlobWriteFailed {
                capture_id: capture_id.to_string(),
                reason: format!("delete: {}", e),
            }),
        }
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::Corrupted(e.to_string()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Corrupted(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(BLOB_EXT) {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local blob store, for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, capture_id: &str) -> bool {
        self.blobs.lock().contains_key(capture_id)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, capture_id: &str, bytes: &[u8]) -> StorageResult<()> {
        self.blobs.lock().insert(capture_id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read(&self, capture_id: &str) -> StorageResult<Vec<u8>> {
        self.blobs
            .lock()
            .get(capture_id)
            .cloned()
            .ok_or_else(|| StorageError::BlobNotFound(capture_id.to_string()))
    }

    async fn delete(&self, capture_id: &str) -> StorageResult<()> {
        self.blobs.lock().remove(capture_id);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self.blobs.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
