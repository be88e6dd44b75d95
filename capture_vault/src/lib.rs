//! # Capture Vault
//!
//! Encrypted local store for evidence captures, with a resumable upload queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      CAPTURE VAULT                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │  KEY STORE  │  │  ENCRYPTION │  │  UPLOAD          │  │
//! │  │  (wrapped)  │  │  AES-256-GCM│  │  COORDINATOR     │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘  │
//! │         │                │                   │            │
//! │  ┌──────┴────────────────┴───────────────────┴─────────┐ │
//! │  │          CAPTURE INDEX (SQLite, durable)             │ │
//! │  │   status · retry state · transfer id · key id        │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! │                                                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │  BLOB STORE │  │  QUOTA      │  │  TRANSPORT       │  │
//! │  │  (atomic)   │  │  + CLEANUP  │  │  (opaque backend)│  │
//! │  └─────────────┘  └─────────────┘  └──────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Captures are encrypted before they touch disk, one fresh IV per capture
//! - At most one upload per capture is in flight
//! - The process may die at any point; recovery works from the index alone
//! - Blobs are deleted before their index entry, never the other way round
//! - Raw key material is never logged

pub mod blobs;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod index;
pub mod locks;
pub mod quota;
pub mod status;
pub mod transport;
pub mod vault;

pub use blobs::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::{QuotaConfig, UploadConfig, VaultConfig};
pub use coordinator::{RecoveryReport, UploadCoordinator, UploadResolution};
pub use crypto::{EncryptionMetadata, FileKeyStore, KeyStore, MemoryKeyStore};
pub use error::{CaptureError, CaptureResult, CryptoError, StorageError, UploadError};
pub use index::{CaptureIndex, CaptureIndexEntry, CaptureMetadata, MediaType};
pub use quota::{CleanupReport, QuotaStatus, StorageQuotaManager};
pub use status::CaptureStatus;
pub use transport::{classify_http_status, DirectoryTransport, UploadRequest, UploadTransport};
pub use vault::CaptureVault;

/// Capture Vault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
