//! AES-256-GCM primitives and key material.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Raw key length for AES-256.
pub const KEY_LEN: usize = 32;
/// GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

const INDEX_KEY_LABEL: &[u8] = b"ragvault/index-key/v1";

/// Errors from symmetric cryptography.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Sealing failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),
    /// Opening failed: wrong key, wrong associated data or tampered bytes.
    #[error("Decryption failed: {0}")]
    Decryption(String),
    /// Key material had the wrong size or encoding.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    /// Ciphertext or plaintext did not have the expected shape.
    #[error("Malformed payload: {0}")]
    Malformed(String),
    /// Deriving a subkey failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// 256-bit symmetric key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Fresh key from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key bytes; the slice must be exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Decode a base64 (standard alphabet) encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut decoded = BASE64
            .decode(encoded.trim())
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// One-way identifier of the key: SHA-256 hex.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&"<redacted>").finish()
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        // Compare fingerprints so equality never short-circuits on raw bytes.
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for SecretKey {}

pub(crate) fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt with a fresh nonce. Output layout: `nonce ‖ ciphertext ‖ tag`.
pub(crate) fn seal_with(
    cipher: &Aes256Gcm,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = random_nonce();
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption("AES-GCM encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`seal_with`].
pub(crate) fn open_with(
    cipher: &Aes256Gcm,
    payload: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Malformed(format!(
            "payload of {} bytes is shorter than nonce and tag",
            payload.len()
        )));
    }
    let (nonce, sealed) = payload.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| CryptoError::Decryption("AES-GCM decryption failed".into()))
}

/// Seal `plaintext` under `key`, binding it to `aad`.
pub fn seal(key: &SecretKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    seal_with(&key.cipher(), plaintext, aad)
}

/// Open a payload produced by [`seal`] with the same key and associated data.
pub fn open(key: &SecretKey, payload: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    open_with(&key.cipher(), payload, aad)
}

/// Derive the subkey that guards a tenant's index metadata.
pub fn derive_index_key(tenant_key: &SecretKey) -> Result<SecretKey, CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(tenant_key.as_bytes())
        .map_err(|err| CryptoError::KeyDerivation(err.to_string()))?;
    mac.update(INDEX_KEY_LABEL);
    let mut derived = mac.finalize().into_bytes();
    let key = SecretKey::from_bytes(&derived);
    derived.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = SecretKey::generate();
        let sealed = seal(&key, b"payload", b"acme").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 7 + TAG_LEN);
        assert_eq!(open(&key, &sealed, b"acme").unwrap(), b"payload");
    }

    #[test]
    fn open_rejects_wrong_key_and_wrong_aad() {
        let key = SecretKey::generate();
        let sealed = seal(&key, b"payload", b"acme").unwrap();

        let other = SecretKey::generate();
        assert!(matches!(
            open(&other, &sealed, b"acme"),
            Err(CryptoError::Decryption(_))
        ));
        assert!(matches!(
            open(&key, &sealed, b"globex"),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn open_rejects_tampering_and_truncation() {
        let key = SecretKey::generate();
        let mut sealed = seal(&key, b"payload", b"").unwrap();
        sealed[NONCE_LEN] ^= 0xff;
        assert!(matches!(
            open(&key, &sealed, b""),
            Err(CryptoError::Decryption(_))
        ));
        assert!(matches!(
            open(&key, &sealed[..10], b""),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn nonces_differ_between_seals() {
        let key = SecretKey::generate();
        let first = seal(&key, b"same", b"").unwrap();
        let second = seal(&key, b"same", b"").unwrap();
        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
        assert_ne!(first, second);
    }

    #[test]
    fn base64_keys_must_be_32_bytes() {
        let encoded = BASE64.encode([7u8; KEY_LEN]);
        let key = SecretKey::from_base64(&encoded).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; KEY_LEN]);

        let short = BASE64.encode([7u8; 16]);
        assert!(matches!(
            SecretKey::from_base64(&short),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(SecretKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let key = SecretKey::from_bytes(&[0xab; KEY_LEN]).unwrap();
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn index_key_is_deterministic_and_distinct() {
        let key = SecretKey::generate();
        let first = derive_index_key(&key).unwrap();
        let second = derive_index_key(&key).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, key);
        assert_eq!(key.fingerprint().len(), 64);
    }
}
