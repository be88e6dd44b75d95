//! Byte/string conversion helpers used for persisting IVs and metadata.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{CryptoError, CryptoResult};

/// Encode bytes as standard padded base64
pub fn bytes_to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard padded base64. Malformed input is always rejected.
pub fn base64_to_bytes(encoded: &str) -> CryptoResult<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEncoding(format!("base64: {}", e)))
}

/// UTF-8 encode a string
pub fn string_to_bytes(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

/// UTF-8 decode bytes
pub fn bytes_to_string(bytes: &[u8]) -> CryptoResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CryptoError::InvalidEncoding(format!("utf-8: {}", e)))
}
