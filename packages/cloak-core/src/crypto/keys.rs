//! # Identity Keys
//!
//! RSA-OAEP (2048-bit modulus, SHA-256) key pairs. The public half is
//! published on the server so chat keys can be wrapped for its owner; the
//! private half never leaves the client unencrypted.
//!
//! ## Wire Formats
//!
//! | Item         | Encoding                     |
//! |--------------|------------------------------|
//! | Public key   | base64(SPKI DER)             |
//! | Private key  | PKCS#8 DER (then encrypted)  |
//! | Wrapped key  | base64(RSA-OAEP ciphertext)  |

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::aead::ChatKey;
use super::encoding;
use crate::error::{Error, Result};

/// RSA modulus size in bits
pub const RSA_KEY_BITS: usize = 2048;

/// Public half of an identity key pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicIdentityKey(RsaPublicKey);

impl PublicIdentityKey {
    /// Parse a base64 SPKI public key as stored on the user row
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let der = encoding::decode(encoded)?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| Error::InvalidKey(format!("Invalid public key: {}", e)))?;
        Ok(Self(key))
    }

    /// Export as base64 SPKI
    pub fn to_base64(&self) -> Result<String> {
        let der = self
            .0
            .to_public_key_der()
            .map_err(|e| Error::InvalidKey(format!("Failed to export public key: {}", e)))?;
        Ok(encoding::encode(der.as_bytes()))
    }

    /// Wrap a chat key so only the owner of this public key can recover it
    pub fn wrap_key(&self, chat_key: &ChatKey) -> Result<Vec<u8>> {
        let mut rng = rand::rngs::OsRng;
        self.0
            .encrypt(&mut rng, Oaep::new::<Sha256>(), chat_key.as_bytes())
            .map_err(|e| Error::EncryptionFailed(format!("Key wrap failed: {}", e)))
    }
}

/// An identity key pair held in client memory
#[derive(Clone)]
pub struct IdentityKeyPair {
    private: RsaPrivateKey,
    public: PublicIdentityKey,
}

impl IdentityKeyPair {
    /// Generate a new 2048-bit key pair
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| Error::KeyDerivationFailed(format!("RSA key generation failed: {}", e)))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = PublicIdentityKey(RsaPublicKey::from(&private));
        Self { private, public }
    }

    /// Import a key pair from PKCS#8 DER
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| Error::InvalidKey(format!("Invalid private key: {}", e)))?;
        Ok(Self::from_private(private))
    }

    /// Export the private key as PKCS#8 DER. The buffer is wiped on drop.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| Error::InvalidKey(format!("Failed to export private key: {}", e)))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn public_key(&self) -> &PublicIdentityKey {
        &self.public
    }

    /// Recover a chat key wrapped for this key pair
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<ChatKey> {
        let raw = Zeroizing::new(
            self.private
                .decrypt(Oaep::new::<Sha256>(), wrapped)
                .map_err(|_| Error::DecryptionFailed("Key unwrap failed".into()))?,
        );
        ChatKey::from_slice(&raw)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
