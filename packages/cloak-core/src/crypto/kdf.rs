//! # Password Key Derivation
//!
//! PBKDF2-HMAC-SHA256 turns the login password and a stored salt into the
//! AES key that protects the identity private key at rest.
//!
//! ```text
//! password ──┐
//! salt (16) ─┼──► PBKDF2-HMAC-SHA256 (100 000 rounds) ──► 32-byte key
//! ```

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use super::aead::{ChatKey, KEY_SIZE};
use crate::error::{Error, Result};

/// PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length in bytes
pub const SALT_SIZE: usize = 16;

/// Generate a fresh random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the private-key protection key from a password.
///
/// The same password and salt always give the same key.
pub fn derive_password_key(password: &str, salt: &[u8]) -> Result<ChatKey> {
    if salt.is_empty() {
        return Err(Error::KeyDerivationFailed("Salt must not be empty".into()));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    Ok(ChatKey::from_bytes(key))
}
