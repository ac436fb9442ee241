//! # Identity Bootstrap
//!
//! Turns a password into a usable private key and back.
//!
//! ## First Login
//!
//! ```text
//! generate RSA-OAEP 2048 ──► export PKCS#8 ──┐
//! fresh salt ──PBKDF2(password)──► key ───────┼──► AES-GCM(iv) ──► blob
//!                                             │
//! KeyBundle { public_key, encrypted_private_key: blob, iv, salt }
//! ```
//!
//! The bundle is sent once with the first login and stored on the user row.
//!
//! ## Every Later Login
//!
//! The server hands the stored bundle back in `AuthInfo`;
//! [`unlock_private_key`] re-derives the protection key and decrypts the blob.
//! A wrong password fails the GCM tag check and surfaces as
//! [`Error::BadCredential`], the same error the server uses for an unknown
//! user.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, encoding, ChatKey, IdentityKeyPair, Nonce};
use crate::error::{Error, Result};

/// Public key plus the password-protected private key, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// base64 SPKI
    pub public_key: String,
    /// base64 AES-GCM ciphertext of the PKCS#8 private key
    pub encrypted_private_key: String,
    /// 12-byte AES-GCM nonce
    pub iv: Vec<u8>,
    /// 16-byte PBKDF2 salt
    pub salt: Vec<u8>,
}

/// Create a new key pair and protect it under `password`.
pub fn bootstrap(password: &str) -> Result<(IdentityKeyPair, KeyBundle)> {
    let pair = IdentityKeyPair::generate()?;
    let bundle = protect_private_key(&pair, password)?;
    tracing::debug!("Generated identity key pair");
    Ok((pair, bundle))
}

/// Encrypt an existing key pair's private half under `password`, with a fresh
/// salt and IV.
pub fn protect_private_key(pair: &IdentityKeyPair, password: &str) -> Result<KeyBundle> {
    let salt = crypto::generate_salt();
    let protection_key = crypto::derive_password_key(password, &salt)?;
    let der = pair.to_pkcs8_der()?;
    let (nonce, ciphertext) = crypto::encrypt(&protection_key, &der)?;

    Ok(KeyBundle {
        public_key: pair.public_key().to_base64()?,
        encrypted_private_key: encoding::encode(&ciphertext),
        iv: nonce.as_bytes().to_vec(),
        salt: salt.to_vec(),
    })
}

/// Re-derive the protection key and decrypt the stored private key.
///
/// Every failure (malformed blob, wrong IV length, tag mismatch, bad
/// PKCS#8) is reported as [`Error::BadCredential`]. Nothing is returned
/// unless the whole chain succeeds.
pub fn unlock_private_key(
    password: &str,
    encrypted_private_key: &str,
    iv: &[u8],
    salt: &[u8],
) -> Result<IdentityKeyPair> {
    try_unlock(password, encrypted_private_key, iv, salt).map_err(|e| {
        tracing::debug!(error = %e, "Private key unlock failed");
        Error::BadCredential
    })
}

fn try_unlock(
    password: &str,
    encrypted_private_key: &str,
    iv: &[u8],
    salt: &[u8],
) -> Result<IdentityKeyPair> {
    let protection_key: ChatKey = crypto::derive_password_key(password, salt)?;
    let nonce = Nonce::from_slice(iv)?;
    let ciphertext = encoding::decode(encrypted_private_key)?;
    let der = zeroize::Zeroizing::new(crypto::decrypt(&protection_key, &nonce, &ciphertext)?);
    IdentityKeyPair::from_pkcs8_der(&der)
}
