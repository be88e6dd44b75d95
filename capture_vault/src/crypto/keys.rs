//! Capture Vault - Key Material
//!
//! Capture keys, IVs and HKDF derivation.

use std::fmt;

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;

use super::encoding::{base64_to_bytes, bytes_to_base64};
use crate::error::{CryptoError, CryptoResult};

/// Key length for AES-256
pub const KEY_LEN: usize = 32;

/// Nonce length for AES-GCM (96 bits)
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// HKDF contexts for key derivation
pub mod contexts {
    /// Context for the key-store wrapping key
    pub const KEY_WRAP: &[u8] = b"ALFA:CAPTURE:KEYWRAP:v1";
}

/// 256-bit capture key, zeroized on drop
pub struct CaptureKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl CaptureKey {
    /// Create a capture key from bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Create a capture key from an arbitrary slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self::new(array))
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }
}

impl fmt::Debug for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CaptureKey([REDACTED])")
    }
}

/// 96-bit AES-GCM nonce. Must never repeat under the same key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Iv([u8; NONCE_LEN]);

impl Iv {
    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Storage encoding
    pub fn to_base64(&self) -> String {
        bytes_to_base64(&self.0)
    }

    /// Parse the storage encoding, rejecting anything that is not 12 bytes
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = base64_to_bytes(encoded)?;
        let array: [u8; NONCE_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidIv(format!(
                "expected {} bytes, got {}",
                NONCE_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iv({})", self.to_base64())
    }
}

/// Generate a random IV from the thread-local CSPRNG
pub fn generate_iv() -> Iv {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    Iv(nonce)
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> CryptoResult<CaptureKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];

    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyStore(format!("key derivation failed: {}", e)))?;

    Ok(CaptureKey::new(okm))
}
