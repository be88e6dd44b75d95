//! Capture Vault - Cryptographic Core
//!
//! Authenticated encryption of capture payloads and key storage.

pub mod aead;
pub mod encoding;
pub mod keys;
pub mod keystore;

pub use aead::*;
pub use encoding::*;
pub use keys::*;
pub use keystore::*;
