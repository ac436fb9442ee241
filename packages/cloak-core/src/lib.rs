//! # Cloak Core
//!
//! Shared building blocks for Cloak, a two-party end-to-end encrypted chat.
//! The server brokers keys, membership and delivery; it never holds
//! plaintext or an unlocked private key.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLOAK CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────────────┐  │
//! │  │   Crypto    │  │  Identity   │  │            Client               │  │
//! │  │             │  │             │  │                                 │  │
//! │  │ - AES-GCM   │◄─│ - Bootstrap │◄─│ - CryptoEngine                  │  │
//! │  │ - RSA-OAEP  │  │ - Unlock    │  │ - ChatKeyCache (coalescing)     │  │
//! │  │ - PBKDF2    │  │             │  │ - RetryQueue (FIFO)             │  │
//! │  └─────────────┘  └─────────────┘  │ - Connection (WebSocket)        │  │
//! │                                    └────────────────┬────────────────┘  │
//! │  ┌─────────────────────────────────────────────┐    │                   │
//! │  │  Protocol: ClientFrame / ServerFrame / Event │◄───┘                   │
//! │  └─────────────────────────────────────────────┘                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error taxonomy and wire codes
//! - [`crypto`] - Cryptographic primitives
//! - [`identity`] - Password-protected identity keys
//! - [`protocol`] - Wire schema shared with the server
//! - [`client`] - Client runtime

pub mod client;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;

pub use crypto::{ChatKey, IdentityKeyPair, PublicIdentityKey};
pub use error::{Error, Result};
pub use identity::KeyBundle;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
