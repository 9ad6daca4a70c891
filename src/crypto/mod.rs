//! AES-256-GCM encryption with PBKDF2 key derivation.
//!
//! Every call to [`encrypt`] draws a fresh salt and nonce, derives a key from
//! the caller's secret and seals the plaintext. The result is a self-describing
//! [`EncryptedPayload`] that can be stored as JSON and decrypted later with
//! the same secret.
//!
//! # Security
//! - PBKDF2-HMAC-SHA256, 100,000 iterations, 256-bit key
//! - 16-byte random salt per encryption (never reused)
//! - 12-byte random nonce per encryption
//! - Authenticated encryption: tampering with the ciphertext or nonce is
//!   detected and rejected, never returned as corrupted plaintext

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{AuthError, Result};

/// Current payload format version
pub const PAYLOAD_VERSION: u32 = 1;

/// PBKDF2 iterations for key derivation
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Size of the derived key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the salt in bytes
pub const SALT_SIZE: usize = 16;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Versioned, base64-encoded AEAD output.
///
/// Serialized as `{"v":1,"salt":"...","iv":"...","ciphertext":"..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub v: u32,
    pub salt: String,
    pub iv: String,
    pub ciphertext: String,
}

/// 256-bit key derived from a secret. Zeroized on drop.
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Derives an AES-256-GCM key from `secret` and `salt` with PBKDF2-HMAC-SHA256.
pub fn derive_key(secret: &str, salt: &[u8]) -> Result<DerivedKey> {
    if secret.is_empty() {
        return Err(AuthError::Encryption("secret must not be empty".to_string()));
    }
    if salt.len() != SALT_SIZE {
        return Err(AuthError::Encryption(format!(
            "salt must be {} bytes, got {}",
            SALT_SIZE,
            salt.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    Ok(DerivedKey(key))
}

/// Encrypts plaintext under a key derived from `secret`.
///
/// # Returns
/// * `Ok(EncryptedPayload)` - version 1 payload with fresh salt and nonce
/// * `Err` - If the secret is empty or the cipher fails
pub fn encrypt(plaintext: &str, secret: &str) -> Result<EncryptedPayload> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(secret, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| AuthError::Encryption(format!("cipher failure: {}", e)))?;

    Ok(EncryptedPayload {
        v: PAYLOAD_VERSION,
        salt: BASE64.encode(salt),
        iv: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Decrypts a payload produced by [`encrypt`].
///
/// # Returns
/// * `Ok(String)` - Decrypted plaintext
/// * `Err(AuthError::Decryption)` - Wrong secret, tampered data, or malformed payload
pub fn decrypt(payload: &EncryptedPayload, secret: &str) -> Result<String> {
    if payload.v != PAYLOAD_VERSION {
        return Err(AuthError::Decryption(format!(
            "unsupported payload version {}",
            payload.v
        )));
    }
    if secret.is_empty() {
        return Err(AuthError::Decryption("secret must not be empty".to_string()));
    }

    let salt = decode_field("salt", &payload.salt, Some(SALT_SIZE))?;
    let nonce_bytes = decode_field("iv", &payload.iv, Some(NONCE_SIZE))?;
    let ciphertext = decode_field("ciphertext", &payload.ciphertext, None)?;

    let key = derive_key(secret, &salt).map_err(|e| AuthError::Decryption(e.to_string()))?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| {
            AuthError::Decryption("authentication failed (wrong secret or tampered data)".to_string())
        })?;

    String::from_utf8(plaintext)
        .map_err(|_| AuthError::Decryption("plaintext is not valid UTF-8".to_string()))
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| AuthError::Decryption(format!("invalid base64 in {}: {}", name, e)))?;

    if let Some(expected) = expected_len {
        if bytes.len() != expected {
            return Err(AuthError::Decryption(format!(
                "invalid {} size: expected {}, got {}",
                name,
                expected,
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "correct horse battery staple";

    fn flip_bit(field: &str, byte: usize, bit: u8) -> String {
        let mut bytes = BASE64.decode(field).unwrap();
        bytes[byte] ^= 1 << bit;
        BASE64.encode(bytes)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        for plaintext in ["", "sk-test-123", "{\"apiKey\":\"rk_live_abc\"}", "ünïcödé 🔐"] {
            let payload = encrypt(plaintext, SECRET).expect("Encryption failed");
            assert_eq!(payload.v, PAYLOAD_VERSION);
            assert_ne!(payload.ciphertext, plaintext);

            let decrypted = decrypt(&payload, SECRET).expect("Decryption failed");
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_call() {
        let a = encrypt("same-plaintext", SECRET).unwrap();
        let b = encrypt("same-plaintext", SECRET).unwrap();

        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_payload_field_sizes() {
        let payload = encrypt("secret", SECRET).unwrap();
        assert_eq!(BASE64.decode(&payload.salt).unwrap().len(), SALT_SIZE);
        assert_eq!(BASE64.decode(&payload.iv).unwrap().len(), NONCE_SIZE);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let payload = encrypt("secret", SECRET).unwrap();
        let result = decrypt(&payload, "another secret");
        assert!(matches!(result, Err(AuthError::Decryption(_))));
    }

    #[test]
    fn test_ciphertext_bit_flips_detected() {
        let payload = encrypt("token-value", SECRET).unwrap();
        let len = BASE64.decode(&payload.ciphertext).unwrap().len();

        // Every byte, a couple of bit positions each; the tag covers all of it
        for byte in 0..len {
            for bit in [0u8, 7] {
                let mut tampered = payload.clone();
                tampered.ciphertext = flip_bit(&payload.ciphertext, byte, bit);
                assert!(
                    decrypt(&tampered, SECRET).is_err(),
                    "flip at byte {} bit {} was accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_iv_bit_flips_detected() {
        let payload = encrypt("token-value", SECRET).unwrap();

        for byte in 0..NONCE_SIZE {
            let mut tampered = payload.clone();
            tampered.iv = flip_bit(&payload.iv, byte, 3);
            assert!(decrypt(&tampered, SECRET).is_err());
        }
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        let payload = encrypt("secret", SECRET).unwrap();

        let mut wrong_version = payload.clone();
        wrong_version.v = 2;
        assert!(decrypt(&wrong_version, SECRET).is_err());

        let mut bad_base64 = payload.clone();
        bad_base64.ciphertext = "not-valid-base64!@#$".to_string();
        assert!(decrypt(&bad_base64, SECRET).is_err());

        let mut short_iv = payload.clone();
        short_iv.iv = BASE64.encode([0u8; 8]);
        assert!(decrypt(&short_iv, SECRET).is_err());

        let mut short_salt = payload;
        short_salt.salt = BASE64.encode([0u8; 4]);
        assert!(decrypt(&short_salt, SECRET).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(encrypt("x", ""), Err(AuthError::Encryption(_))));
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let a = derive_key(SECRET, &salt).unwrap();
        let b = derive_key(SECRET, &salt).unwrap();
        let c = derive_key("other", &salt).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = encrypt("x", SECRET).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["v"], 1);
        assert!(json["salt"].is_string());
        assert!(json["iv"].is_string());
        assert!(json["ciphertext"].is_string());
    }
}
