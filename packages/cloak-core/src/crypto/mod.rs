//! # Cryptographic Primitives
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CLOAK KEY HIERARCHY                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  password + salt ──PBKDF2──► protection key                             │
//! │                                   │ AES-GCM                             │
//! │                                   ▼                                     │
//! │                        RSA private key (PKCS#8)                         │
//! │                                   │ RSA-OAEP unwrap                     │
//! │                                   ▼                                     │
//! │                  chat key (chat, version), 256-bit                      │
//! │                                   │ AES-GCM                             │
//! │                                   ▼                                     │
//! │                           message plaintext                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`aead`]: AES-256-GCM encrypt/decrypt and the [`ChatKey`] type
//! - [`kdf`]: PBKDF2 password derivation
//! - [`keys`]: RSA-OAEP identity keys and key wrapping
//! - [`encoding`]: base64 for the wire

pub mod aead;
pub mod encoding;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, encrypt, ChatKey, Nonce, KEY_SIZE, NONCE_SIZE};
pub use kdf::{derive_password_key, generate_salt, PBKDF2_ITERATIONS, SALT_SIZE};
pub use keys::{IdentityKeyPair, PublicIdentityKey};
