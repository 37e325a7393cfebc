use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;

use crate::error::ApiError;

/// Encrypt plaintext with AES-256-GCM and base64-encode the result for
/// single-column storage. Layout: `nonce (12) || ciphertext || tag (16)`.
/// The nonce is freshly random per call, so two encryptions of the same
/// plaintext never collide.
pub fn encrypt(plaintext: &[u8], master_key: &[u8; 32]) -> anyhow::Result<String> {
    let cipher = Aes256Gcm::new_from_slice(master_key)
        .map_err(|e| anyhow::anyhow!("failed to create cipher: {e}"))?;

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut combined = Vec::with_capacity(12 + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(combined))
}

/// Decrypt a value produced by [`encrypt`].
pub fn decrypt(encoded: &str, master_key: &[u8; 32]) -> anyhow::Result<Vec<u8>> {
    let combined = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| anyhow::anyhow!("stored credential is not valid base64: {e}"))?;

    if combined.len() < 12 {
        anyhow::bail!("encrypted data too short (need at least 12 bytes for nonce)");
    }

    let cipher = Aes256Gcm::new_from_slice(master_key)
        .map_err(|e| anyhow::anyhow!("failed to create cipher: {e}"))?;

    let nonce = Nonce::from_slice(&combined[..12]);
    cipher
        .decrypt(nonce, &combined[12..])
        .map_err(|e| anyhow::anyhow!("decryption failed (wrong key or corrupted data): {e}"))
}

/// Decrypt and interpret as UTF-8 — the shape stored credentials take.
pub fn decrypt_string(encoded: &str, master_key: &[u8; 32]) -> Result<String, ApiError> {
    let plain = decrypt(encoded, master_key).map_err(ApiError::Internal)?;
    String::from_utf8(plain)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("credential is not valid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [42u8; 32];
        let plaintext = "p@ssw0rd-with-unicode-ü".as_bytes();
        let encrypted = encrypt(plaintext, &key).unwrap();

        let decrypted = decrypt(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ciphertext_layout() {
        let key = [42u8; 32];
        let encrypted = encrypt(b"x", &key).unwrap();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&encrypted)
            .unwrap();
        // nonce (12) + plaintext (1) + tag (16)
        assert_eq!(raw.len(), 12 + 1 + 16);
    }

    #[test]
    fn different_encryptions_differ() {
        let key = [42u8; 32];
        let e1 = encrypt(b"same", &key).unwrap();
        let e2 = encrypt(b"same", &key).unwrap();
        // Different nonces → different ciphertext
        assert_ne!(e1, e2);
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let key1 = [42u8; 32];
        let key2 = [99u8; 32];
        let encrypted = encrypt(b"secret", &key1).unwrap();
        assert!(decrypt(&encrypted, &key2).is_err());
    }

    #[test]
    fn decrypt_corrupted_data_fails() {
        let key = [42u8; 32];
        let encrypted = encrypt(b"secret", &key).unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&encrypted)
            .unwrap();
        if let Some(byte) = raw.last_mut() {
            *byte ^= 0xFF;
        }
        let corrupted = base64::engine::general_purpose::STANDARD.encode(raw);
        assert!(decrypt(&corrupted, &key).is_err());
    }

    #[test]
    fn decrypt_garbage_fails() {
        let key = [42u8; 32];
        assert!(decrypt("not base64 at all!!", &key).is_err());
        assert!(decrypt("YWJj", &key).is_err()); // valid base64, too short
    }
}
