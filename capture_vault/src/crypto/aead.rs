//! Capture Vault - AEAD Encryption
//!
//! AES-256-GCM over capture payloads. Ciphertext and tag travel together
//! (`ciphertext || tag`); the IV and key id are kept in [`EncryptionMetadata`],
//! persisted next to the blob rather than inside it.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keys::{CaptureKey, Iv, TAG_LEN};
use crate::error::{CryptoError, CryptoResult};

/// Algorithm identifier stored with every capture
pub const ALGORITHM: &str = "AES-256-GCM";

/// Everything needed to decrypt a capture blob except the key itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    /// Key store identifier of the key that sealed the blob
    pub key_id: String,
    /// Base64 96-bit nonce
    pub iv: String,
    /// Always [`ALGORITHM`]
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
}

impl EncryptionMetadata {
    /// Decode the stored IV
    pub fn iv(&self) -> CryptoResult<Iv> {
        Iv::from_base64(&self.iv)
    }
}

/// Stamp metadata for a freshly encrypted blob
pub fn create_encryption_metadata(key_id: &str, iv: &Iv) -> EncryptionMetadata {
    EncryptionMetadata {
        key_id: key_id.to_string(),
        iv: iv.to_base64(),
        algorithm: ALGORITHM.to_string(),
        created_at: Utc::now(),
    }
}

/// Encrypt with AES-256-GCM. Output is `plaintext.len() + 16` bytes.
pub fn encrypt_data(plaintext: &[u8], key: &CaptureKey, iv: &Iv) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    cipher
        .encrypt(Nonce::from_slice(iv.as_bytes()), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Decrypt `ciphertext || tag`.
///
/// The tag is verified before any plaintext is produced, so a failure never
/// leaks partial output.
pub fn decrypt_data(input: &[u8], key: &CaptureKey, iv: &Iv) -> CryptoResult<Vec<u8>> {
    if input.len() < TAG_LEN {
        return Err(CryptoError::DataTooShort {
            len: input.len(),
            min: TAG_LEN,
        });
    }

    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    cipher
        .decrypt(Nonce::from_slice(iv.as_bytes()), input)
        .map_err(|_| CryptoError::AuthenticationFailed)
}
