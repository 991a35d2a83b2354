//! Symmetric Encryption (AES-256-GCM)
//!
//! Authenticated encryption for the bulk data inside each onion layer.
//! Session keys are single-use and random; the 96-bit IV travels in the
//! clear next to the ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as GcmNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AUTH_TAG_SIZE, IV_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A 256-bit AES-GCM key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

/// A 96-bit GCM initialization vector
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Iv {
    bytes: [u8; IV_SIZE],
}

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

impl Iv {
    /// Create an IV from raw bytes
    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != IV_SIZE {
            return Err(CryptoError::InvalidIvLength {
                expected: IV_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; IV_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random IV
    pub fn generate() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.bytes
    }

    /// Convert to bytes
    pub fn to_bytes(&self) -> [u8; IV_SIZE] {
        self.bytes
    }
}

impl std::fmt::Debug for Iv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Iv({})", hex::encode(self.bytes))
    }
}

/// Encrypt plaintext using AES-256-GCM
///
/// Returns ciphertext with the authentication tag appended (16 bytes
/// longer than the input).
pub fn encrypt(key: &SymmetricKey, iv: &Iv, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let nonce = GcmNonce::from_slice(&iv.bytes);

    cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("AES-GCM encryption failed".into()))
}

/// Decrypt ciphertext using AES-256-GCM
///
/// Input must include the 16-byte authentication tag at the end. Fails
/// with `AuthTagInvalid` on any tag mismatch; the frame is not retried.
pub fn decrypt(key: &SymmetricKey, iv: &Iv, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < AUTH_TAG_SIZE {
        return Err(CryptoError::AuthTagInvalid);
    }

    let cipher = Aes256Gcm::new_from_slice(&key.bytes).map_err(|_| CryptoError::AuthTagInvalid)?;

    let nonce = GcmNonce::from_slice(&iv.bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::AuthTagInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymmetricKey::generate();
        let iv = Iv::generate();
        let plaintext = b"Hello, veil!";

        let ciphertext = encrypt(&key, &iv, plaintext).unwrap();
        assert_ne!(ciphertext.as_slice(), plaintext);
        assert_eq!(ciphertext.len(), plaintext.len() + AUTH_TAG_SIZE);

        let decrypted = decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = SymmetricKey::generate();
        let iv = Iv::generate();

        let ciphertext = encrypt(&key, &iv, b"").unwrap();
        assert_eq!(ciphertext.len(), AUTH_TAG_SIZE);

        let decrypted = decrypt(&key, &iv, &ciphertext).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SymmetricKey::generate();
        let key2 = SymmetricKey::generate();
        let iv = Iv::generate();

        let ciphertext = encrypt(&key1, &iv, b"Test message").unwrap();
        let result = decrypt(&key2, &iv, &ciphertext);

        assert!(matches!(result, Err(CryptoError::AuthTagInvalid)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SymmetricKey::generate();
        let iv = Iv::generate();

        let mut ciphertext = encrypt(&key, &iv, b"Test message").unwrap();
        ciphertext[0] ^= 0x01;

        let result = decrypt(&key, &iv, &ciphertext);
        assert!(matches!(result, Err(CryptoError::AuthTagInvalid)));
    }

    #[test]
    fn test_tampered_iv_fails() {
        let key = SymmetricKey::generate();
        let iv = Iv::generate();

        let ciphertext = encrypt(&key, &iv, b"Test message").unwrap();

        let mut bad = iv.to_bytes();
        bad[3] ^= 0x80;
        let result = decrypt(&key, &Iv::from_bytes(bad), &ciphertext);

        assert!(matches!(result, Err(CryptoError::AuthTagInvalid)));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = SymmetricKey::generate();
        let iv = Iv::generate();

        let result = decrypt(&key, &iv, &[0u8; 4]);
        assert!(matches!(result, Err(CryptoError::AuthTagInvalid)));
    }
}
