//! Capture Vault - Key Stores
//!
//! Key material is only ever addressed by an opaque key id. The platform
//! keychain is an external collaborator; `FileKeyStore` is the portable
//! fallback, keeping every key wrapped under a KEK derived from a master seed.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use zeroize::Zeroizing;

use super::aead::{decrypt_data, encrypt_data};
use super::keys::{contexts, derive_key, generate_iv, CaptureKey, Iv, KEY_LEN, NONCE_LEN};
use crate::error::{CryptoError, CryptoResult};

/// Secure key storage accessed by key id
pub trait KeyStore: Send + Sync {
    /// Fetch a key; `KeyNotFound` if absent
    fn get(&self, key_id: &str) -> CryptoResult<CaptureKey>;

    /// Store (or replace) a key
    fn put(&self, key_id: &str, key: &CaptureKey) -> CryptoResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key_id: &str) -> CryptoResult<()>;

    fn contains(&self, key_id: &str) -> CryptoResult<bool> {
        match self.get(key_id) {
            Ok(_) => Ok(true),
            Err(CryptoError::KeyNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local key store, for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, Zeroizing<[u8; KEY_LEN]>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key_id: &str) -> CryptoResult<CaptureKey> {
        self.keys
            .lock()
            .get(key_id)
            .map(|bytes| CaptureKey::new(**bytes))
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))
    }

    fn put(&self, key_id: &str, key: &CaptureKey) -> CryptoResult<()> {
        self.keys
            .lock()
            .insert(key_id.to_string(), Zeroizing::new(*key.expose()));
        Ok(())
    }

    fn delete(&self, key_id: &str) -> CryptoResult<()> {
        self.keys.lock().remove(key_id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// File-backed store
// ═══════════════════════════════════════════════════════════════════════════

/// Key store keeping one wrapped key per file: `[NONCE 12B][KEY 32B][TAG 16B]`
pub struct FileKeyStore {
    dir: PathBuf,
    kek: CaptureKey,
}

impl FileKeyStore {
    /// Open a key store rooted at `dir`, wrapping keys under a KEK derived from `master_seed`
    pub fn open(dir: &Path, master_seed: &[u8]) -> CryptoResult<Self> {
        if master_seed.len() < KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: master_seed.len(),
            });
        }

        fs::create_dir_all(dir).map_err(|e| CryptoError::KeyStore(e.to_string()))?;
        let kek = derive_key(master_seed, b"capture_vault", contexts::KEY_WRAP)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            kek,
        })
    }

    fn key_path(&self, key_id: &str) -> CryptoResult<PathBuf> {
        let valid = !key_id.is_empty()
            && key_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CryptoError::KeyStore(format!("invalid key id: {:?}", key_id)));
        }
        Ok(self.dir.join(format!("{}.key", key_id)))
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, key_id: &str) -> CryptoResult<CaptureKey> {
        let path = self.key_path(key_id)?;
        let wrapped = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CryptoError::KeyNotFound(key_id.to_string()))
            }
            Err(e) => return Err(CryptoError::KeyStore(e.to_string())),
        };

        if wrapped.len() < NONCE_LEN {
            return Err(CryptoError::DataTooShort {
                len: wrapped.len(),
                min: NONCE_LEN,
            });
        }

        let (nonce, sealed) = wrapped.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);

        let plain = Zeroizing::new(decrypt_data(sealed, &self.kek, &Iv::from_bytes(nonce_bytes))?);
        CaptureKey::from_slice(&plain)
    }

    fn put(&self, key_id: &str, key: &CaptureKey) -> CryptoResult<()> {
        let path = self.key_path(key_id)?;
        let iv = generate_iv();
        let sealed = encrypt_data(key.expose(), &self.kek, &iv)?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + sealed.len());
        wrapped.extend_from_slice(iv.as_bytes());
        wrapped.extend_from_slice(&sealed);

        let temp_path = path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(&wrapped)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };

        write().map_err(|e| CryptoError::KeyStore(e.to_string()))
    }

    fn delete(&self, key_id: &str) -> CryptoResult<()> {
        let path = self.key_path(key_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::KeyStore(e.to_string())),
        }
    }
}
