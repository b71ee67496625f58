//! Field-level envelope encryption with a pluggable KMS.
//!
//! Encryption modes per tenant:
//!
//! - `platform` — encrypted at rest, decrypted on API read (transparent).
//! - `client`   — encrypted at rest with the tenant key; reads return
//!   ciphertext and the client decrypts out-of-band.
//! - `sealed`   — encrypted with the tenant's PUBLIC key only (RSA-OAEP
//!   hybrid). The server can never decrypt.
//! - `disabled` — identity transform.
//!
//! DEK resolution fallback chain:
//!
//! 1. tenant has an active key row        → tenant DEK
//! 2. tenant mode is `sealed`             → public key only, no symmetric DEK
//! 3. no key row                          → system DEK (platform mode)
//! 4. key row with `status = 'disabled'`  → no encryption
//! 5. no tenant id                        → no encryption

mod sealed;
mod service;

pub use sealed::decrypt_sealed_fields;
pub use service::{EncryptionService, FieldMode, try_decrypt_value};

use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error(transparent)]
    Kms(#[from] p8_kms::KmsError),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("key generation failed: {0}")]
    KeyGen(String),
    #[error("invalid key material: {0}")]
    KeyMaterial(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Lowercase-hex SHA-256 of `text`. Used for embedding content-hash dedup.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// AAD bound into every field encrypt: `"{tenant_id}:{entity_id}"`.
/// Prevents ciphertext from decrypting under another tenant or row.
pub(crate) fn field_aad(tenant_id: &str, entity_id: &str) -> Vec<u8> {
    format!("{tenant_id}:{entity_id}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello "));
    }

    #[test]
    fn aad_binds_tenant_and_entity() {
        assert_eq!(field_aad("t1", "e1"), b"t1:e1".to_vec());
        assert_ne!(field_aad("t1", "e1"), field_aad("t2", "e1"));
    }
}
