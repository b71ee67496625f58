//! Sealed mode — hybrid encryption under the tenant's RSA public key.
//!
//! Every field gets a fresh ephemeral AES-256-GCM key, wrapped with
//! RSA-OAEP-SHA256. Packed layout:
//!
//! ```text
//! len(wrapped_dek):2 BE ‖ wrapped_dek ‖ nonce:12 ‖ ciphertext+tag
//! ```
//!
//! The server holds only the public key and can never decrypt;
//! [`decrypt_sealed_fields`] exists for clients and tests.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::{Map, Value};

use crate::{CryptoError, FieldMode, Result, field_aad};

const RSA_BITS: usize = 4096;

/// Generate an RSA-4096 pair; returns `(public_key, public_pem, private_pem)`.
/// The private PEM is handed to the tenant once and never persisted.
pub(crate) fn generate_sealed_keypair() -> Result<(RsaPublicKey, String, String)> {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let pub_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
    let priv_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?
        .to_string();
    Ok((public_key, pub_pem, priv_pem))
}

/// Seal one plaintext under `pub_key`, returning the base64 packed payload.
pub(crate) fn seal_value(pub_key: &RsaPublicKey, plaintext: &[u8], aad: &[u8]) -> Result<String> {
    let mut rng = rand::rngs::OsRng;

    // Ephemeral symmetric DEK — used once, then discarded.
    let mut ephemeral_dek = [0u8; 32];
    rng.fill_bytes(&mut ephemeral_dek);
    let mut nonce_bytes = [0u8; 12];
    rng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&ephemeral_dek));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload { msg: plaintext, aad },
        )
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let wrapped_dek = pub_key
        .encrypt(&mut rng, Oaep::new::<sha2::Sha256>(), &ephemeral_dek)
        .map_err(|e| CryptoError::Encrypt(format!("rsa wrap: {e}")))?;

    let mut packed =
        Vec::with_capacity(2 + wrapped_dek.len() + nonce_bytes.len() + ciphertext.len());
    packed.extend_from_slice(&(wrapped_dek.len() as u16).to_be_bytes());
    packed.extend_from_slice(&wrapped_dek);
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(B64.encode(packed))
}

/// Client-side decryption for sealed fields. Requires the tenant's private
/// key; in production the client implements this in their own stack.
///
/// Undecryptable fields are left verbatim — mixed-state rows are expected.
pub fn decrypt_sealed_fields(
    encrypted_fields: &[(&str, FieldMode)],
    data: &mut Map<String, Value>,
    tenant_id: &str,
    private_key_pem: &str,
) -> Result<()> {
    if encrypted_fields.is_empty() {
        return Ok(());
    }
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| CryptoError::KeyMaterial(format!("invalid private key pem: {e}")))?;

    let entity_id = match data.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    };
    let aad = field_aad(tenant_id, &entity_id);

    for (field, _) in encrypted_fields {
        let Some(Value::String(stored)) = data.get(*field) else {
            continue;
        };
        if let Some(plain) = unseal_value(&private_key, stored, &aad) {
            data.insert(field.to_string(), Value::String(plain));
        }
    }
    Ok(())
}

fn unseal_value(private_key: &RsaPrivateKey, stored: &str, aad: &[u8]) -> Option<String> {
    let raw = B64.decode(stored).ok()?;
    if raw.len() < 2 {
        return None;
    }
    let dek_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    if raw.len() < 2 + dek_len + 12 {
        return None;
    }
    let wrapped_dek = &raw[2..2 + dek_len];
    let nonce = &raw[2 + dek_len..2 + dek_len + 12];
    let ciphertext = &raw[2 + dek_len + 12..];

    let ephemeral_dek = private_key
        .decrypt(Oaep::new::<sha2::Sha256>(), wrapped_dek)
        .ok()?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&ephemeral_dek));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .ok()?;
    String::from_utf8(plaintext).ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // RSA-4096 generation is slow; share one pair across the module's tests.
    fn keypair() -> &'static (RsaPublicKey, String, String) {
        use std::sync::OnceLock;
        static PAIR: OnceLock<(RsaPublicKey, String, String)> = OnceLock::new();
        PAIR.get_or_init(|| generate_sealed_keypair().unwrap())
    }

    #[test]
    fn seal_and_unseal_round_trip() {
        let (pub_key, _, priv_pem) = keypair();
        let aad = b"tenant-x:entity-1";
        let sealed = seal_value(pub_key, b"top secret", aad).unwrap();

        let private_key = RsaPrivateKey::from_pkcs8_pem(priv_pem).unwrap();
        let plain = unseal_value(&private_key, &sealed, aad).unwrap();
        assert_eq!(plain, "top secret");
    }

    #[test]
    fn unseal_fails_with_wrong_aad() {
        let (pub_key, _, priv_pem) = keypair();
        let sealed = seal_value(pub_key, b"bound", b"tenant-x:e1").unwrap();
        let private_key = RsaPrivateKey::from_pkcs8_pem(priv_pem).unwrap();
        assert!(unseal_value(&private_key, &sealed, b"tenant-y:e1").is_none());
    }

    #[test]
    fn decrypt_sealed_fields_leaves_plaintext_untouched() {
        let (pub_key, _, priv_pem) = keypair();
        let fields = [("content", FieldMode::Randomized)];

        let mut data = json!({"id": "e1", "content": "was never sealed"})
            .as_object()
            .unwrap()
            .clone();
        // content is plain text, not a sealed payload — must be left alone.
        decrypt_sealed_fields(&fields, &mut data, "tenant-x", priv_pem).unwrap();
        assert_eq!(data["content"], json!("was never sealed"));

        // Now the round trip.
        let sealed = seal_value(pub_key, b"sealed body", b"tenant-x:e1").unwrap();
        data.insert("content".to_string(), Value::String(sealed));
        decrypt_sealed_fields(&fields, &mut data, "tenant-x", priv_pem).unwrap();
        assert_eq!(data["content"], json!("sealed body"));
    }
}
