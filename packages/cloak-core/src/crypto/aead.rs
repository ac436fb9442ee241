//! # Symmetric Encryption
//!
//! AES-256-GCM for message bodies and for the private key at rest.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  encrypt(key, plaintext)                                               │
//! │                                                                         │
//! │   key (32 bytes) ──┐                                                   │
//! │   nonce (12 bytes, random) ──┼──► AES-256-GCM ──► ciphertext ‖ tag     │
//! │   plaintext ───────┘                                                   │
//! │                                                                         │
//! │  The nonce travels next to the ciphertext (`iv` on the wire).           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of a symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A 96-bit nonce for AES-GCM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a nonce from a wire value, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!(
                "IV must be {} bytes, got {}",
                NONCE_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// A 256-bit symmetric key.
///
/// Used both as the per-chat key and as the PBKDF2-derived key that protects
/// the identity private key. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop, PartialEq, Eq)]
pub struct ChatKey([u8; KEY_SIZE]);

impl ChatKey {
    /// Generate a fresh random key from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from an unwrapped buffer, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!("Chat key must be {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ChatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChatKey(..)")
    }
}

/// Encrypt with AES-256-GCM under a fresh random nonce.
///
/// Returns the nonce and `ciphertext ‖ tag`.
pub fn encrypt(key: &ChatKey, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>)> {
    let nonce = Nonce::random();
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce.0), plaintext)
        .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?;

    Ok((nonce, ciphertext))
}

/// Decrypt AES-256-GCM output.
///
/// ## Errors
///
/// Returns `DecryptionFailed` if the key or nonce is wrong or the ciphertext
/// was tampered with. Nothing is returned on tag mismatch.
pub fn decrypt(key: &ChatKey, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::DecryptionFailed("Ciphertext shorter than tag".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::DecryptionFailed(format!("Invalid key: {}", e)))?;

    cipher
        .decrypt(AesNonce::from_slice(&nonce.0), ciphertext)
        .map_err(|_| Error::DecryptionFailed("Decryption failed: authentication tag mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_texts() {
        let key = ChatKey::generate();
        for text in ["", "hello, bob", "héllo wörld — 你好 🔐"] {
            let (nonce, ciphertext) = encrypt(&key, text.as_bytes()).unwrap();
            let decrypted = decrypt(&key, &nonce, &ciphertext).unwrap();
            assert_eq!(String::from_utf8(decrypted).unwrap(), text);
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = ChatKey::generate();
        let (nonce, mut ciphertext) = encrypt(&key, b"Hello, World!").unwrap();
        ciphertext[0] ^= 0xFF;

        let result = decrypt(&key, &nonce, &ciphertext);
        assert!(matches!(result, Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (nonce, ciphertext) = encrypt(&ChatKey::generate(), b"secret").unwrap();
        assert!(decrypt(&ChatKey::generate(), &nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_different_nonces_produce_different_ciphertext() {
        let key = ChatKey::from_bytes([42u8; 32]);
        let (n1, c1) = encrypt(&key, b"same").unwrap();
        let (n2, c2) = encrypt(&key, b"same").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_length_checks() {
        assert!(Nonce::from_slice(&[0u8; 11]).is_err());
        assert!(Nonce::from_slice(&[0u8; 12]).is_ok());
        assert!(ChatKey::from_slice(&[0u8; 31]).is_err());
        assert!(ChatKey::from_slice(&[0u8; 32]).is_ok());
    }
}
