//! # Error Handling
//!
//! One error type shared by the server and the client.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Session Errors (100-199)                                          │
//! │  │   ├── BadCredential         - Wrong password or unknown user        │
//! │  │   ├── AlreadyInitialized    - Key pair already set                  │
//! │  │   ├── NotAuthenticated      - Operation needs a logged-in session   │
//! │  │   └── AlreadyAuthenticated  - Second login on one connection        │
//! │  │                                                                      │
//! │  ├── Directory Errors (200-299)                                        │
//! │  │   ├── UserNotFound          - Counterpart does not exist            │
//! │  │   ├── ChatNotFound          - Chat does not exist                   │
//! │  │   ├── NotMember             - Caller never joined the chat          │
//! │  │   └── InvalidRequest        - Rejected at the boundary              │
//! │  │                                                                      │
//! │  ├── Key Errors (300-399)                                              │
//! │  │   ├── MissingPublicKey      - Member has no key pair yet            │
//! │  │   ├── StaleKey              - A newer chat key version exists       │
//! │  │   └── KeyNotFound           - No wrapped key at that version        │
//! │  │                                                                      │
//! │  ├── Crypto Errors (400-499)                                           │
//! │  ├── Storage Errors (500-599)                                          │
//! │  ├── Network Errors (600-699)                                          │
//! │  │   ├── Disconnected          - Transport lost mid-call               │
//! │  │   └── Timeout               - No response in time                   │
//! │  │                                                                      │
//! │  └── Internal Errors (900-999)                                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Codes travel on the wire inside every failed response, so a client can
//! rebuild the variant with [`Error::from_code`] and react to it (refresh the
//! chat key on `StaleKey`, queue a retry on `Disconnected`).

use thiserror::Error;

/// Result type alias for Cloak operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cloak
///
/// `Clone` because coalesced client calls hand the same outcome to every
/// waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Session Errors (100-199)
    // ========================================================================

    /// Wrong password or unknown user. Both cases share this variant and
    /// this message.
    #[error("Invalid username or password.")]
    BadCredential,

    /// The account already has a key pair
    #[error("Key pair has already been set for this account.")]
    AlreadyInitialized,

    /// The connection has not completed login
    #[error("Not authenticated.")]
    NotAuthenticated,

    /// Login was already performed on this connection
    #[error("Already authenticated.")]
    AlreadyAuthenticated,

    // ========================================================================
    // Directory Errors (200-299)
    // ========================================================================

    /// User does not exist
    #[error("User not found.")]
    UserNotFound,

    /// Chat does not exist
    #[error("Chat not found.")]
    ChatNotFound,

    /// Caller is not a joined member of the chat
    #[error("Not a member of this chat.")]
    NotMember,

    /// Request failed boundary validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ========================================================================
    // Key Errors (300-399)
    // ========================================================================

    /// A joined member has not bootstrapped a key pair
    #[error("User {user_id} has no public key.")]
    MissingPublicKey { user_id: i64 },

    /// The claimed key version has been superseded
    #[error("Chat key is stale; refresh the key before sending.")]
    StaleKey,

    /// No wrapped key for the caller at this version
    #[error("Chat key not found: {0}")]
    KeyNotFound(String),

    // ========================================================================
    // Crypto Errors (400-499)
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    // ========================================================================
    // Storage Errors (500-599)
    // ========================================================================

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    // ========================================================================
    // Network Errors (600-699)
    // ========================================================================

    /// Transport lost while a call was in flight
    #[error("Disconnected from server.")]
    Disconnected,

    /// Failed to connect to the server
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Protocol-level error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Failure reported by the server that has no local variant
    #[error("{message}")]
    Remote { code: i32, message: String },

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Get the wire error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Session
    /// - 200-299: Directory
    /// - 300-399: Chat keys
    /// - 400-499: Crypto
    /// - 500-599: Storage
    /// - 600-699: Network
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Session (100-199)
            Error::BadCredential => 100,
            Error::AlreadyInitialized => 101,
            Error::NotAuthenticated => 102,
            Error::AlreadyAuthenticated => 103,

            // Directory (200-299)
            Error::UserNotFound => 200,
            Error::ChatNotFound => 201,
            Error::NotMember => 202,
            Error::InvalidRequest(_) => 203,

            // Keys (300-399)
            Error::MissingPublicKey { .. } => 300,
            Error::StaleKey => 301,
            Error::KeyNotFound(_) => 302,

            // Crypto (400-499)
            Error::EncryptionFailed(_) => 400,
            Error::DecryptionFailed(_) => 401,
            Error::InvalidKey(_) => 402,
            Error::KeyDerivationFailed(_) => 403,

            // Storage (500-599)
            Error::DatabaseError(_) => 500,

            // Network (600-699)
            Error::Disconnected => 600,
            Error::ConnectionFailed(_) => 601,
            Error::Timeout(_) => 602,
            Error::ProtocolError(_) => 603,
            Error::Remote { code, .. } => *code,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Rebuild an error from a code and message received on the wire.
    ///
    /// Variants whose payload cannot be recovered from the message come back
    /// as [`Error::Remote`] with the original code.
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            100 => Error::BadCredential,
            101 => Error::AlreadyInitialized,
            102 => Error::NotAuthenticated,
            103 => Error::AlreadyAuthenticated,
            200 => Error::UserNotFound,
            201 => Error::ChatNotFound,
            202 => Error::NotMember,
            203 => Error::InvalidRequest(message),
            301 => Error::StaleKey,
            302 => Error::KeyNotFound(message),
            _ => Error::Remote { code, message },
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by retrying, possibly after the
    /// caller refreshes its state (a stale chat key, a dropped socket).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Disconnected
                | Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::StaleKey
        )
    }

    /// Message safe to send to a remote peer.
    ///
    /// Storage and internal failures are reduced to a generic line so their
    /// details stay in the server log.
    pub fn public_message(&self) -> String {
        match self {
            Error::DatabaseError(_) | Error::Internal(_) => "Internal server error.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::DeserializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::BadCredential.code(), 100);
        assert_eq!(Error::AlreadyInitialized.code(), 101);
        assert_eq!(Error::UserNotFound.code(), 200);
        assert_eq!(Error::NotMember.code(), 202);
        assert_eq!(Error::MissingPublicKey { user_id: 7 }.code(), 300);
        assert_eq!(Error::StaleKey.code(), 301);
        assert_eq!(Error::Disconnected.code(), 600);
        assert_eq!(Error::Internal("x".into()).code(), 900);
    }

    #[test]
    fn test_from_code_restores_taxonomy() {
        for err in [
            Error::BadCredential,
            Error::AlreadyInitialized,
            Error::UserNotFound,
            Error::NotMember,
            Error::StaleKey,
        ] {
            assert_eq!(Error::from_code(err.code(), err.to_string()), err);
        }
    }

    #[test]
    fn test_from_code_unknown_is_remote() {
        let err = Error::from_code(300, "User 4 has no public key.");
        assert_eq!(err.code(), 300);
        assert_eq!(err.to_string(), "User 4 has no public key.");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Disconnected.is_recoverable());
        assert!(Error::Timeout("call".into()).is_recoverable());
        assert!(Error::StaleKey.is_recoverable());
        assert!(!Error::BadCredential.is_recoverable());
        assert!(!Error::NotMember.is_recoverable());
    }

    #[test]
    fn test_public_message_hides_storage_details() {
        let err = Error::DatabaseError("disk I/O error at /var/lib".into());
        assert_eq!(err.public_message(), "Internal server error.");
        assert_eq!(Error::BadCredential.public_message(), "Invalid username or password.");
    }
}
