//! Capture Vault - Error Types

use thiserror::Error;

use crate::status::CaptureStatus;

/// Result type for vault operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Result type for index / blob storage operations
pub type StorageResult<T> = Result<T, StorageError>;

// ═══════════════════════════════════════════════════════════════
// CRYPTO ERRORS
// ═══════════════════════════════════════════════════════════════

/// Errors raised by the encryption layer and key stores
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Authentication failed - ciphertext tampered or wrong key/IV")]
    AuthenticationFailed,

    #[error("Data too short: {len} bytes (minimum: {min})")]
    DataTooShort { len: usize, min: usize },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid IV: {0}")]
    InvalidIv(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key store error: {0}")]
    KeyStore(String),
}

// ═══════════════════════════════════════════════════════════════
// STORAGE ERRORS
// ═══════════════════════════════════════════════════════════════

/// Errors raised by the capture index, blob store and quota manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage quota exceeded: {reason} ({reclaimable} bytes reclaimable by cleanup)")]
    QuotaExceeded { reason: String, reclaimable: u64 },

    #[error("Blob write failed for {capture_id}: {reason}")]
    BlobWriteFailed { capture_id: String, reason: String },

    #[error("Blob read failed for {capture_id}: {reason}")]
    BlobReadFailed { capture_id: String, reason: String },

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Duplicate capture id: {0}")]
    DuplicateCaptureId(String),

    #[error("Capture not found in index: {0}")]
    CaptureNotFound(String),

    #[error("Invalid transition for {capture_id}: {from} -> {to}")]
    InvalidTransition {
        capture_id: String,
        from: CaptureStatus,
        to: CaptureStatus,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Index corrupted: {0}")]
    Corrupted(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════
// UPLOAD ERRORS
// ═══════════════════════════════════════════════════════════════

/// Three-way classification of a backend response. `Ok(())` is success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Network unreachable, timeouts, 5xx. Retried with backoff.
    #[error("Retriable upload failure: {0}")]
    Retriable(String),

    /// 4xx auth/validation failures. Never retried.
    #[error("Permanent upload failure: {0}")]
    Permanent(String),
}

impl UploadError {
    pub fn reason(&self) -> &str {
        match self {
            UploadError::Retriable(reason) | UploadError::Permanent(reason) => reason,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// VAULT ERRORS
// ═══════════════════════════════════════════════════════════════

/// Top-level error for vault operations
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Upload coordinator is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for CaptureError {
    fn from(e: serde_json::Error) -> Self {
        CaptureError::Serialization(e.to_string())
    }
}

impl CaptureError {
    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            CaptureError::Crypto(CryptoError::AuthenticationFailed)
                | CaptureError::Storage(StorageError::Corrupted(_))
        )
    }

    /// Check if the user has to act (clean up storage, retry or delete a capture)
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            CaptureError::Storage(StorageError::QuotaExceeded { .. })
                | CaptureError::Upload(UploadError::Permanent(_))
        )
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CaptureError::Upload(UploadError::Retriable(_))
                | CaptureError::Storage(StorageError::BlobReadFailed { .. })
                | CaptureError::Storage(StorageError::BlobWriteFailed { .. })
                | CaptureError::Io(_)
        )
    }
}
