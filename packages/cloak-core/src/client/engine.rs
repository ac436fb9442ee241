//! Client crypto engine: owns the unlocked private key and turns wrapped
//! chat keys and ciphertext into plaintext.

use crate::crypto::{self, encoding, ChatKey, IdentityKeyPair, Nonce};
use crate::error::{Error, Result};
use crate::identity;
use crate::protocol::{AuthInfo, MessageResource};

/// An encrypted message body ready for `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBody {
    /// base64 AES-GCM ciphertext
    pub ciphertext: String,
    pub iv: Vec<u8>,
}

/// A history entry after decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub message: MessageResource,
    pub text: String,
}

pub struct CryptoEngine {
    keys: IdentityKeyPair,
}

impl CryptoEngine {
    pub fn new(keys: IdentityKeyPair) -> Self {
        Self { keys }
    }

    /// Unlock the private key carried in a login response.
    pub fn from_auth(password: &str, auth: &AuthInfo) -> Result<Self> {
        let bundle = auth
            .key_bundle()
            .ok_or_else(|| Error::KeyNotFound("account has no key pair".into()))?;
        let keys = identity::unlock_private_key(
            password,
            &bundle.encrypted_private_key,
            &bundle.iv,
            &bundle.salt,
        )?;
        Ok(Self { keys })
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.keys
    }

    /// Unwrap a base64 chat key delivered by the server.
    pub fn unwrap_chat_key(&self, encrypted_chat_key: &str) -> Result<ChatKey> {
        let wrapped = encoding::decode(encrypted_chat_key)?;
        self.keys.unwrap_key(&wrapped)
    }

    pub fn encrypt_text(&self, key: &ChatKey, text: &str) -> Result<EncryptedBody> {
        let (nonce, ciphertext) = crypto::encrypt(key, text.as_bytes())?;
        Ok(EncryptedBody {
            ciphertext: encoding::encode(&ciphertext),
            iv: nonce.as_bytes().to_vec(),
        })
    }

    pub fn decrypt_text(&self, key: &ChatKey, ciphertext: &str, iv: &[u8]) -> Result<String> {
        let nonce = Nonce::from_slice(iv)?;
        let raw = encoding::decode(ciphertext)?;
        let plain = crypto::decrypt(key, &nonce, &raw)?;
        String::from_utf8(plain)
            .map_err(|e| Error::DecryptionFailed(format!("Message is not UTF-8: {}", e)))
    }
}
