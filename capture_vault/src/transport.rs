//! Capture Vault - Upload Transport
//!
//! The backend is opaque: it receives the encrypted blob plus its metadata
//! and answers success, retriable failure or permanent failure. The vault
//! never sends plaintext.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::crypto::EncryptionMetadata;
use crate::error::UploadError;
use crate::index::CaptureMetadata;

/// One delivery attempt of one capture
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub capture_id: String,
    /// Durable id correlating OS wake events back to the capture
    pub transfer_id: String,
    /// `ciphertext ‖ tag`
    pub ciphertext: Vec<u8>,
    pub encryption: EncryptionMetadata,
    pub metadata: CaptureMetadata,
}

/// Backend endpoint
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError>;
}

/// Map an HTTP response code onto an upload outcome
pub fn classify_http_status(code: u16) -> Result<(), UploadError> {
    match code {
        200..=299 => Ok(()),
        408 | 425 | 429 | 500..=599 => Err(UploadError::Retriable(format!("HTTP {}", code))),
        _ => Err(UploadError::Permanent(format!("HTTP {}", code))),
    }
}

/// Sidecar written next to each delivered blob
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeliveryManifest {
    capture_id: String,
    transfer_id: String,
    encryption: EncryptionMetadata,
    metadata: CaptureMetadata,
}

/// Delivers to a local or NAS directory: `<id>.enc` + `<id>.json`
pub struct DirectoryTransport {
    target: PathBuf,
}

impl DirectoryTransport {
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    async fn deliver(&self, request: &UploadRequest) -> std::io::Result<()> {
        fs::create_dir_all(&self.target).await?;

        let blob_path = self.target.join(format!("{}.enc", request.capture_id));
        let temp_path = self.target.join(format!("{}.enc.part", request.capture_id));
        fs::write(&temp_path, &request.ciphertext).await?;
        fs::rename(&temp_path, &blob_path).await?;

        // Manifest last: a present .json means the blob is complete
        let manifest = DeliveryManifest {
            capture_id: request.capture_id.clone(),
            transfer_id: request.transfer_id.clone(),
            encryption: request.encryption.clone(),
            metadata: request.metadata.clone(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(self.target.join(format!("{}.json", request.capture_id)), json).await
    }
}

#[async_trait]
impl UploadTransport for DirectoryTransport {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError> {
        match self.deliver(request).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Err(UploadError::Permanent(format!("{}: {}", self.target.display(), e)))
            }
            Err(e) => Err(UploadError::Retriable(format!("{}: {}", self.target.display(), e))),
        }
    }
}
