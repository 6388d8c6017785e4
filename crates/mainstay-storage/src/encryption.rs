//! Secret encryption at rest
//!
//! AES-256-GCM with a PBKDF2-HMAC-SHA256 derived key. Every record gets a
//! random 32-byte salt and 16-byte nonce; the stored payload is
//! `salt(32) || nonce(16) || tag(16) || ciphertext`, base64-encoded for a
//! TEXT column.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 16;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

type Cipher = AesGcm<Aes256, U16>;

/// Encryption failures.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption key is not configured")]
    MissingKey,

    #[error("failed to encrypt value: {0}")]
    Encrypt(String),

    #[error("failed to decrypt value: {0}")]
    Decrypt(String),
}

/// Derives per-record keys from a configured passphrase and seals/opens
/// secret values. Thread-safe; key derivation happens per operation.
#[derive(Clone)]
pub struct EncryptionService {
    passphrase: String,
}

impl EncryptionService {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(self.passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
        key
    }

    /// Seal plaintext into the packed, base64-encoded representation.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = Cipher::new_from_slice(&key)
            .map_err(|e| EncryptionError::Encrypt(e.to_string()))?;

        // The aead API appends the tag to the ciphertext; the stored layout
        // wants it up front, so split it back out.
        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&nonce), Payload::from(plaintext))
            .map_err(|e| EncryptionError::Encrypt(e.to_string()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        let mut packed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + TAG_SIZE + ciphertext.len());
        packed.extend_from_slice(&salt);
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(tag);
        packed.extend_from_slice(ciphertext);
        Ok(BASE64.encode(packed))
    }

    /// Open a packed, base64-encoded value.
    pub fn decrypt(&self, stored: &str) -> Result<Vec<u8>, EncryptionError> {
        let packed = BASE64
            .decode(stored)
            .map_err(|e| EncryptionError::Decrypt(e.to_string()))?;
        if packed.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(EncryptionError::Decrypt("value too short".to_string()));
        }

        let (salt, rest) = packed.split_at(SALT_SIZE);
        let (nonce, rest) = rest.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        let key = self.derive_key(salt);
        let cipher = Cipher::new_from_slice(&key)
            .map_err(|e| EncryptionError::Decrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        cipher
            .decrypt(
                Nonce::<U16>::from_slice(nonce),
                Payload::from(sealed.as_slice()),
            )
            .map_err(|_| EncryptionError::Decrypt("data corrupted or wrong key".to_string()))
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<String, EncryptionError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_to_string(&self, stored: &str) -> Result<String, EncryptionError> {
        let plaintext = self.decrypt(stored)?;
        String::from_utf8(plaintext)
            .map_err(|_| EncryptionError::Decrypt("decrypted value is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let service = EncryptionService::new("correct horse battery staple");
        let sealed = service.encrypt_string("sk-live-123456").unwrap();
        assert_eq!(service.decrypt_to_string(&sealed).unwrap(), "sk-live-123456");
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let service = EncryptionService::new("key");
        let a = service.encrypt_string("same").unwrap();
        let b = service.encrypt_string("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(service.decrypt_to_string(&a).unwrap(), "same");
        assert_eq!(service.decrypt_to_string(&b).unwrap(), "same");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = EncryptionService::new("key-a")
            .encrypt_string("secret")
            .unwrap();
        let err = EncryptionService::new("key-b").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, EncryptionError::Decrypt(_)));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let service = EncryptionService::new("key");
        let sealed = service.encrypt_string("secret").unwrap();
        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = BASE64.encode(bytes);
        assert!(service.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_packed_layout() {
        let service = EncryptionService::new("key");
        let sealed = service.encrypt(b"x").unwrap();
        let packed = BASE64.decode(sealed).unwrap();
        // salt + nonce + tag + 1 byte of ciphertext
        assert_eq!(packed.len(), SALT_SIZE + NONCE_SIZE + TAG_SIZE + 1);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let service = EncryptionService::new("key");
        assert!(service.decrypt(&BASE64.encode([0u8; 10])).is_err());
    }
}
