//! Capture Vault - Main Vault Implementation
//!
//! Wires key store, blob store, index, quota manager and upload coordinator
//! together. Nothing here is a global: callers construct the vault, `start`
//! it, and `shutdown` it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::blobs::{BlobStore, FsBlobStore};
use crate::config::VaultConfig;
use crate::coordinator::{RecoveryReport, UploadCoordinator, UploadResolution};
use crate::crypto::{
    create_encryption_metadata, decrypt_data, encrypt_data, generate_iv, CaptureKey, KeyStore,
};
use crate::error::{CaptureResult, StorageError, UploadError};
use crate::index::{CaptureIndex, CaptureIndexEntry, CaptureMetadata, NewCapture};
use crate::locks::CaptureLocks;
use crate::quota::{CleanupReport, QuotaStatus, StorageQuotaManager};
use crate::status::CaptureStatus;
use crate::transport::UploadTransport;

/// Vault layout under the root directory
const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "db/index.db";
const CAPTURES_DIR: &str = "captures";

/// Vault state keys
const ACTIVE_KEY_ID: &str = "active_key_id";
const RETIRED_KEY_IDS: &str = "retired_key_ids";

/// Capture Vault - Main entry point
pub struct CaptureVault {
    /// Vault root path, `None` for in-memory vaults
    root: Option<PathBuf>,
    config: VaultConfig,
    keys: Arc<dyn KeyStore>,
    index: Arc<CaptureIndex>,
    blobs: Arc<dyn BlobStore>,
    quota: StorageQuotaManager,
    coordinator: UploadCoordinator,
    /// Key id new captures are encrypted under
    active_key_id: RwLock<String>,
    /// Serializes quota check + blob write + admit
    admission: AsyncMutex<()>,
}

impl CaptureVault {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Open (or create) a vault at `root`
    pub async fn open(
        root: &Path,
        keys: Arc<dyn KeyStore>,
        transport: Arc<dyn UploadTransport>,
    ) -> CaptureResult<Self> {
        tokio::fs::create_dir_all(root).await?;
        let blobs = Arc::new(FsBlobStore::open(&root.join(CAPTURES_DIR)).await?);

        let dir = root.to_path_buf();
        let mut vault = blocking(move || {
            let config_path = dir.join(CONFIG_FILE);
            let config = VaultConfig::load_or_default(&config_path)?;
            if !config_path.exists() {
                config.save(&config_path)?;
            }

            let index = Arc::new(CaptureIndex::open(&dir.join(DB_FILE))?);
            Self::with_components(config, keys, index, blobs, transport)
        })
        .await?;
        vault.root = Some(root.to_path_buf());

        log::info!("Vault opened at {}", root.display());
        Ok(vault)
    }

    /// Assemble a vault from explicit components
    pub fn with_components(
        config: VaultConfig,
        keys: Arc<dyn KeyStore>,
        index: Arc<CaptureIndex>,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn UploadTransport>,
    ) -> CaptureResult<Self> {
        config.validate()?;

        let locks = CaptureLocks::new();
        let quota = StorageQuotaManager::new(
            config.quota.clone(),
            Arc::clone(&index),
            Arc::clone(&blobs),
            locks.clone(),
        );
        let coordinator = UploadCoordinator::new(
            Arc::clone(&index),
            Arc::clone(&blobs),
            transport,
            config.upload.clone(),
            locks,
        );

        let active_key_id = Self::ensure_active_key(keys.as_ref(), &index)?;

        Ok(Self {
            root: None,
            config,
            keys,
            index,
            blobs,
            quota,
            coordinator,
            active_key_id: RwLock::new(active_key_id),
            admission: AsyncMutex::new(()),
        })
    }

    fn ensure_active_key(keys: &dyn KeyStore, index: &CaptureIndex) -> CaptureResult<String> {
        if let Some(key_id) = index.get_state(ACTIVE_KEY_ID)? {
            if keys.contains(&key_id)? {
                return Ok(key_id);
            }
            log::warn!("Active key {} missing from key store, generating a new one", key_id);
        }

        let key_id = Self::new_key(keys)?;
        index.set_state(ACTIVE_KEY_ID, &key_id)?;
        Ok(key_id)
    }

    fn new_key(keys: &dyn KeyStore) -> CaptureResult<String> {
        let key_id = format!("key-{}", Uuid::new_v4());
        keys.put(&key_id, &CaptureKey::generate())?;
        log::info!("Generated capture key {}", key_id);
        Ok(key_id)
    }

    /// Sweep orphans, recover interrupted uploads and spawn the upload worker
    pub async fn start(&self) -> CaptureResult<RecoveryReport> {
        let orphans = self.sweep_orphans().await?;
        if !orphans.is_empty() {
            log::warn!("Removed {} orphaned blobs", orphans.len());
        }

        let report = self.coordinator.recover().await?;
        self.coordinator.start()?;
        Ok(report)
    }

    /// Cancel running uploads and stop the worker
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        log::info!("Vault shut down");
    }

    /// Delete blobs no index entry refers to (crash between write and admit).
    /// Only safe before captures are being stored.
    pub async fn sweep_orphans(&self) -> CaptureResult<Vec<String>> {
        let _admission = self.admission.lock().await;

        let known: BTreeSet<String> = self
            .index
            .run(|index| index.list_all())
            .await?
            .into_iter()
            .map(|entry| entry.capture_id)
            .collect();

        let mut removed = Vec::new();
        for id in self.blobs.list().await? {
            if !known.contains(&id) {
                self.blobs.delete(&id).await?;
                removed.push(id);
            }
        }
        Ok(removed)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.coordinator
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CAPTURE OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt and queue a finished capture. Returns the admitted entry.
    pub async fn store_capture(
        &self,
        plaintext: &[u8],
        metadata: CaptureMetadata,
        is_offline_capture: bool,
    ) -> CaptureResult<CaptureIndexEntry> {
        let capture_id = Uuid::new_v4().to_string();

        // Held through admit: prune_keys must see this entry's key as in use
        let _admission = self.admission.lock().await;
        let key_id = self.active_key_id.read().clone();
        let entry = {
            let key = self.key(&key_id).await?;
            let iv = generate_iv();
            let ciphertext = encrypt_data(plaintext, &key, &iv)?;
            let encryption = create_encryption_metadata(&key_id, &iv);

            self.quota.check_admission(ciphertext.len() as u64).await?;

            // Blob first: an entry must never point at a missing blob
            self.blobs.write(&capture_id, &ciphertext).await?;

            let capture = NewCapture {
                capture_id: capture_id.clone(),
                queued_at: Utc::now(),
                total_size: ciphertext.len() as u64,
                is_offline_capture,
                encryption,
                metadata,
            };
            let admitted = self.index.run(move |index| index.admit(capture)).await;
            match admitted {
                Ok(entry) => entry,
                Err(e) => {
                    if let Err(cleanup) = self.blobs.delete(&capture_id).await {
                        log::warn!("Could not remove unadmitted blob {}: {}", capture_id, cleanup);
                    }
                    return Err(e.into());
                }
            }
        };

        log::info!(
            "Stored capture {} ({} bytes, key {})",
            capture_id,
            entry.total_size,
            key_id
        );
        self.coordinator.notify();
        Ok(entry)
    }

    /// Decrypt a locally held capture
    pub async fn read_capture(&self, capture_id: &str) -> CaptureResult<Vec<u8>> {
        let entry = self.require(capture_id).await?;
        let key = self.key(&entry.encryption.key_id).await?;
        let iv = entry.encryption.iv()?;

        let ciphertext = self.blobs.read(capture_id).await?;
        Ok(decrypt_data(&ciphertext, &key, &iv)?)
    }

    pub async fn get(&self, capture_id: &str) -> CaptureResult<Option<CaptureIndexEntry>> {
        let target = capture_id.to_string();
        Ok(self.index.run(move |index| index.get(&target)).await?)
    }

    async fn require(&self, capture_id: &str) -> CaptureResult<CaptureIndexEntry> {
        self.get(capture_id)
            .await?
            .ok_or_else(|| StorageError::CaptureNotFound(capture_id.to_string()).into())
    }

    pub async fn list(&self, status: CaptureStatus) -> CaptureResult<Vec<CaptureIndexEntry>> {
        Ok(self.index.run(move |index| index.list_by_status(status)).await?)
    }

    pub async fn list_all(&self) -> CaptureResult<Vec<CaptureIndexEntry>> {
        Ok(self.index.run(|index| index.list_all()).await?)
    }

    async fn key(&self, key_id: &str) -> CaptureResult<CaptureKey> {
        let (keys, key_id) = (Arc::clone(&self.keys), key_id.to_string());
        blocking(move || Ok(keys.get(&key_id)?)).await
    }

    /// Cancel any upload, delete the blob and forget the capture
    pub async fn discard(&self, capture_id: &str) -> CaptureResult<bool> {
        self.coordinator.discard(capture_id).await
    }

    /// Manual retry of a failed capture
    pub async fn retry(&self, capture_id: &str) -> CaptureResult<CaptureIndexEntry> {
        self.coordinator.retry(capture_id).await
    }

    /// Foreground upload, bypassing backoff
    pub async fn upload_now(&self, capture_id: &str) -> CaptureResult<UploadResolution> {
        self.coordinator.upload_now(capture_id).await
    }

    /// Result of a background transfer delivered by the OS
    pub async fn handle_transfer_event(
        &self,
        transfer_id: &str,
        result: Result<(), UploadError>,
    ) -> CaptureResult<UploadResolution> {
        self.coordinator.handle_transfer_event(transfer_id, result).await
    }

    /// App moving to the background: interrupt running transfers
    pub fn suspend_uploads(&self) -> usize {
        self.coordinator.cancel_all()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUOTA
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn quota_status(&self) -> CaptureResult<QuotaStatus> {
        Ok(self.quota.status().await?)
    }

    pub async fn cleanup_candidates(&self) -> CaptureResult<Vec<CaptureIndexEntry>> {
        Ok(self.quota.cleanup_candidates(Utc::now()).await?)
    }

    /// Evict every current cleanup candidate
    pub async fn cleanup(&self) -> CaptureResult<CleanupReport> {
        let candidates = self.quota.cleanup_candidates(Utc::now()).await?;
        Ok(self.quota.evict(&candidates).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // KEY ROTATION
    // ═══════════════════════════════════════════════════════════════════════

    pub fn active_key_id(&self) -> String {
        self.active_key_id.read().clone()
    }

    /// Encrypt new captures under a fresh key. Existing captures keep theirs.
    pub async fn rotate_key(&self) -> CaptureResult<String> {
        let _admission = self.admission.lock().await;
        let previous = self.active_key_id();

        let (keys, index, retiring) = (
            Arc::clone(&self.keys),
            Arc::clone(&self.index),
            previous.clone(),
        );
        let new_key_id = blocking(move || {
            let new_key_id = Self::new_key(keys.as_ref())?;
            let mut retired = Self::retired_key_ids(&index)?;
            retired.insert(retiring);
            Self::save_retired_key_ids(&index, &retired)?;
            index.set_state(ACTIVE_KEY_ID, &new_key_id)?;
            Ok(new_key_id)
        })
        .await?;

        *self.active_key_id.write() = new_key_id.clone();
        log::info!("Rotated capture key {} -> {}", previous, new_key_id);
        Ok(new_key_id)
    }

    /// Delete retired keys no remaining capture is encrypted under
    pub async fn prune_keys(&self) -> CaptureResult<Vec<String>> {
        // Waits out any capture being stored under a key about to be retired
        let _admission = self.admission.lock().await;

        let (keys, index) = (Arc::clone(&self.keys), Arc::clone(&self.index));
        blocking(move || {
            let in_use: BTreeSet<String> = index.key_ids_in_use()?.into_iter().collect();
            let mut retired = Self::retired_key_ids(&index)?;

            let unused: Vec<String> = retired
                .iter()
                .filter(|key_id| !in_use.contains(*key_id))
                .cloned()
                .collect();

            for key_id in &unused {
                keys.delete(key_id)?;
                retired.remove(key_id);
                log::info!("Deleted retired capture key {}", key_id);
            }

            Self::save_retired_key_ids(&index, &retired)?;
            Ok(unused)
        })
        .await
    }

    fn retired_key_ids(index: &CaptureIndex) -> CaptureResult<BTreeSet<String>> {
        match index.get_state(RETIRED_KEY_IDS)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(BTreeSet::new()),
        }
    }

    fn save_retired_key_ids(index: &CaptureIndex, ids: &BTreeSet<String>) -> CaptureResult<()> {
        let json = serde_json::to_string(ids)?;
        index.set_state(RETIRED_KEY_IDS, &json)?;
        Ok(())
    }
}

/// Run config, key store or SQLite work on the blocking pool
async fn blocking<T, F>(work: F) -> CaptureResult<T>
where
    F: FnOnce() -> CaptureResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(std::io::Error::from)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::MemoryBlobStore;
    use crate::config::QuotaConfig;
    use crate::crypto::MemoryKeyStore;
    use crate::error::{CaptureError, CryptoError, CryptoResult};
    use crate::index::MediaType;
    use crate::transport::DirectoryTransport;
    use tempfile::tempdir;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn photo() -> CaptureMetadata {
        let mut metadata = CaptureMetadata::new(MediaType::Photo);
        metadata.has_depth = true;
        metadata.manifest = Some("bWFuaWZlc3Q=".into());
        metadata
    }

    fn memory_vault(config: VaultConfig, outbox: &Path) -> CaptureVault {
        CaptureVault::with_components(
            config,
            Arc::new(MemoryKeyStore::new()),
            Arc::new(CaptureIndex::open_in_memory().unwrap()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(DirectoryTransport::new(outbox)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_and_read_capture() {
        init_logging();
        let dir = tempdir().unwrap();
        let keys: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let vault = CaptureVault::open(
            &dir.path().join("vault"),
            Arc::clone(&keys),
            Arc::new(DirectoryTransport::new(&dir.path().join("outbox"))),
        )
        .await
        .unwrap();

        let plaintext = b"raw sensor frame with depth".to_vec();
        let entry = vault.store_capture(&plaintext, photo(), true).await.unwrap();

        assert_eq!(entry.status, CaptureStatus::Pending);
        assert_eq!(entry.total_size, plaintext.len() as u64 + 16);
        assert_eq!(entry.encryption.key_id, vault.active_key_id());
        assert!(entry.is_offline_capture);

        let on_disk = std::fs::read(
            dir.path()
                .join("vault")
                .join(CAPTURES_DIR)
                .join(format!("{}.enc", entry.capture_id)),
        )
        .unwrap();
        assert_ne!(&on_disk[..plaintext.len()], &plaintext[..]);
        assert!(dir.path().join("vault").join(CONFIG_FILE).exists());

        assert_eq!(vault.read_capture(&entry.capture_id).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn test_each_capture_gets_a_fresh_iv() {
        let dir = tempdir().unwrap();
        let vault = memory_vault(VaultConfig::default(), dir.path());

        let a = vault.store_capture(b"same", photo(), false).await.unwrap();
        let b = vault.store_capture(b"same", photo(), false).await.unwrap();
        assert_eq!(a.encryption.key_id, b.encryption.key_id);
        assert_ne!(a.encryption.iv, b.encryption.iv);
    }

    #[tokio::test]
    async fn test_tampered_blob_fails_authentication() {
        let dir = tempdir().unwrap();
        let vault = CaptureVault::open(
            &dir.path().join("vault"),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(DirectoryTransport::new(&dir.path().join("outbox"))),
        )
        .await
        .unwrap();
        let entry = vault.store_capture(b"evidence", photo(), false).await.unwrap();

        let path = dir
            .path()
            .join("vault")
            .join(CAPTURES_DIR)
            .join(format!("{}.enc", entry.capture_id));
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        let err = vault.read_capture(&entry.capture_id).await.unwrap_err();
        assert!(err.is_security_critical());
        assert!(matches!(
            err,
            CaptureError::Crypto(CryptoError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_quota_blocks_admission() {
        let dir = tempdir().unwrap();
        let config = VaultConfig {
            quota: QuotaConfig {
                max_captures: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let vault = memory_vault(config, dir.path());

        vault.store_capture(b"one", photo(), false).await.unwrap();
        vault.store_capture(b"two", photo(), false).await.unwrap();

        let err = vault.store_capture(b"three", photo(), false).await.unwrap_err();
        assert!(err.requires_user_action());
        assert!(matches!(
            err,
            CaptureError::Storage(StorageError::QuotaExceeded { reclaimable: 0, .. })
        ));

        let status = vault.quota_status().await.unwrap();
        assert!(status.is_exceeded);
        assert_eq!(status.count, 2);
        assert_eq!(vault.list(CaptureStatus::Pending).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_start_delivers_and_purges() {
        init_logging();
        let dir = tempdir().unwrap();
        let outbox = dir.path().join("outbox");
        let vault = CaptureVault::open(
            &dir.path().join("vault"),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(DirectoryTransport::new(&outbox)),
        )
        .await
        .unwrap();

        let entry = vault.store_capture(b"clip", photo(), false).await.unwrap();
        vault.start().await.unwrap();

        for _ in 0..400 {
            if vault.list_all().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        vault.shutdown().await;

        assert!(vault.get(&entry.capture_id).await.unwrap().is_none());
        let delivered = std::fs::read(outbox.join(format!("{}.enc", entry.capture_id))).unwrap();
        assert_eq!(delivered.len() as u64, entry.total_size);
        assert!(outbox.join(format!("{}.json", entry.capture_id)).exists());
    }

    #[tokio::test]
    async fn test_reopen_keeps_active_key_and_entries() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vault");
        let keys: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let transport = Arc::new(DirectoryTransport::new(&dir.path().join("outbox")));

        let (key_id, capture_id) = {
            let vault = CaptureVault::open(&root, Arc::clone(&keys), transport.clone())
                .await
                .unwrap();
            let entry = vault.store_capture(b"persist me", photo(), false).await.unwrap();
            (vault.active_key_id(), entry.capture_id)
        };

        let vault = CaptureVault::open(&root, keys, transport).await.unwrap();
        assert_eq!(vault.active_key_id(), key_id);
        assert_eq!(vault.read_capture(&capture_id).await.unwrap(), b"persist me");
    }

    #[tokio::test]
    async fn test_sweep_removes_orphaned_blobs() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let vault = CaptureVault::with_components(
            VaultConfig::default(),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(CaptureIndex::open_in_memory().unwrap()),
            blobs.clone(),
            Arc::new(DirectoryTransport::new(dir.path())),
        )
        .unwrap();

        let kept = vault.store_capture(b"kept", photo(), false).await.unwrap();
        blobs.write("orphan", b"half-admitted").await.unwrap();

        assert_eq!(vault.sweep_orphans().await.unwrap(), vec!["orphan"]);
        assert!(blobs.contains(&kept.capture_id));
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_rotate_and_prune_keys() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(MemoryKeyStore::new());
        let vault = CaptureVault::with_components(
            VaultConfig::default(),
            keys.clone(),
            Arc::new(CaptureIndex::open_in_memory().unwrap()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(DirectoryTransport::new(dir.path())),
        )
        .unwrap();

        let first_key = vault.active_key_id();
        let old = vault.store_capture(b"old", photo(), false).await.unwrap();

        let second_key = vault.rotate_key().await.unwrap();
        assert_ne!(first_key, second_key);
        let new = vault.store_capture(b"new", photo(), false).await.unwrap();
        assert_eq!(new.encryption.key_id, second_key);

        // Old capture still decrypts with its own key
        assert_eq!(vault.read_capture(&old.capture_id).await.unwrap(), b"old");
        assert!(vault.prune_keys().await.unwrap().is_empty());

        vault.discard(&old.capture_id).await.unwrap();
        assert_eq!(vault.prune_keys().await.unwrap(), vec![first_key.clone()]);
        assert!(!keys.contains(&first_key).unwrap());
        assert!(keys.contains(&second_key).unwrap());
    }

    #[tokio::test]
    async fn test_prune_never_deletes_key_of_capture_being_stored() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(MemoryKeyStore::new());
        let vault = Arc::new(
            CaptureVault::with_components(
                VaultConfig::default(),
                keys.clone(),
                Arc::new(CaptureIndex::open_in_memory().unwrap()),
                Arc::new(MemoryBlobStore::new()),
                Arc::new(DirectoryTransport::new(dir.path())),
            )
            .unwrap(),
        );
        let first_key = vault.active_key_id();

        // Queue the store ahead of a rotate + prune running against it
        let admission = vault.admission.lock().await;
        let store = {
            let vault = Arc::clone(&vault);
            tokio::spawn(async move { vault.store_capture(b"racing", photo(), false).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let rotate = {
            let vault = Arc::clone(&vault);
            tokio::spawn(async move {
                vault.rotate_key().await?;
                vault.prune_keys().await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(admission);

        let entry = store.await.unwrap().unwrap();
        let pruned = rotate.await.unwrap().unwrap();

        assert_eq!(entry.encryption.key_id, first_key);
        assert!(pruned.is_empty());
        assert!(keys.contains(&first_key).unwrap());
        assert_eq!(vault.read_capture(&entry.capture_id).await.unwrap(), b"racing");
    }

    /// Key store that records which thread served each call
    #[derive(Default)]
    struct ThreadTrackingKeyStore {
        inner: MemoryKeyStore,
        threads: parking_lot::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ThreadTrackingKeyStore {
        fn record(&self) {
            self.threads.lock().push(std::thread::current().id());
        }
    }

    impl KeyStore for ThreadTrackingKeyStore {
        fn get(&self, key_id: &str) -> CryptoResult<CaptureKey> {
            self.record();
            self.inner.get(key_id)
        }

        fn put(&self, key_id: &str, key: &CaptureKey) -> CryptoResult<()> {
            self.record();
            self.inner.put(key_id, key)
        }

        fn delete(&self, key_id: &str) -> CryptoResult<()> {
            self.record();
            self.inner.delete(key_id)
        }
    }

    #[tokio::test]
    async fn test_key_store_is_used_off_the_runtime_thread() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(ThreadTrackingKeyStore::default());
        let vault = CaptureVault::open(
            &dir.path().join("vault"),
            keys.clone(),
            Arc::new(DirectoryTransport::new(&dir.path().join("outbox"))),
        )
        .await
        .unwrap();

        let entry = vault.store_capture(b"offloaded", photo(), false).await.unwrap();
        assert_eq!(vault.read_capture(&entry.capture_id).await.unwrap(), b"offloaded");
        vault.rotate_key().await.unwrap();
        vault.discard(&entry.capture_id).await.unwrap();
        assert_eq!(vault.prune_keys().await.unwrap().len(), 1);

        let runtime_thread = std::thread::current().id();
        let threads = keys.threads.lock().clone();
        // open: contains + put; store, read: get; rotate: put; prune: delete
        assert!(threads.len() >= 5);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn test_cleanup_evicts_failed_captures() {
        let dir = tempdir().unwrap();
        let vault = memory_vault(VaultConfig::default(), dir.path());
        let entry = vault.store_capture(b"doomed", photo(), false).await.unwrap();

        vault
            .index
            .begin_upload(&entry.capture_id, "transfer-1")
            .unwrap();
        vault
            .handle_transfer_event("transfer-1", Err(UploadError::Permanent("HTTP 422".into())))
            .await
            .unwrap();

        let candidates = vault.cleanup_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);

        let report = vault.cleanup().await.unwrap();
        assert_eq!(report.removed, vec![entry.capture_id.clone()]);
        assert_eq!(report.bytes_freed, entry.total_size);
        assert!(vault.list_all().await.unwrap().is_empty());
    }
}
