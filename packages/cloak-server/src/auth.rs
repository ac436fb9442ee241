//! Password login and one-time key bootstrap.
//!
//! Passwords are stored as Argon2id PHC strings. Unknown users are checked
//! against a fixed dummy hash so that "no such user" and "wrong password"
//! take the same time and return the same [`Error::BadCredential`].

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use once_cell::sync::Lazy;
use rusqlite::params;

use cloak_core::protocol::{AuthInfo, Bootstrap};
use cloak_core::{Error, PublicIdentityKey, Result};

use crate::storage::database::{db_err, user_by_id, user_by_username};
use crate::storage::Database;

static DUMMY_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("cloak-timing-equalizer").ok());

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("Password hashing failed: {}", e)))
}

fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Result of a successful password check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The account has a key pair; the connection may authenticate.
    Authenticated(AuthInfo),
    /// Password accepted but the account has no key pair and none was
    /// supplied. The connection stays unauthenticated.
    NeedsBootstrap(AuthInfo),
}

/// Check credentials and, when `bootstrap` is present, set the account's key
/// pair and new password in one update.
pub fn login(
    db: &Database,
    username: &str,
    password: &str,
    bootstrap: Option<&Bootstrap>,
) -> Result<LoginOutcome> {
    let conn = db.connect()?;
    let user = user_by_username(&conn, username)?;

    let user = match user {
        Some(user) if verify_password(password, &user.password_hash) => user,
        Some(user) => {
            tracing::info!(user_id = user.id, "Login rejected");
            return Err(Error::BadCredential);
        }
        None => {
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                verify_password(password, dummy);
            }
            tracing::info!("Login rejected");
            return Err(Error::BadCredential);
        }
    };

    let Some(bootstrap) = bootstrap else {
        return Ok(if user.public_key.is_some() {
            LoginOutcome::Authenticated(user.auth_info())
        } else {
            LoginOutcome::NeedsBootstrap(user.auth_info())
        });
    };

    if user.public_key.is_some() {
        return Err(Error::AlreadyInitialized);
    }
    PublicIdentityKey::from_base64(&bootstrap.keys.public_key)
        .map_err(|_| Error::InvalidRequest("public_key is not an RSA SPKI key".into()))?;

    let new_hash = hash_password(&bootstrap.new_password)?;
    let updated = conn
        .execute(
            "UPDATE users
             SET password_hash = ?, public_key = ?, encrypted_private_key = ?, iv = ?, key_salt = ?
             WHERE id = ? AND public_key IS NULL",
            params![
                new_hash,
                bootstrap.keys.public_key,
                bootstrap.keys.encrypted_private_key,
                bootstrap.keys.iv,
                bootstrap.keys.salt,
                user.id,
            ],
        )
        .map_err(db_err("Failed to store key pair"))?;

    // Another login bootstrapped the account between our read and update.
    if updated == 0 {
        return Err(Error::AlreadyInitialized);
    }

    tracing::info!(user_id = user.id, "Account key pair bootstrapped");
    let user = user_by_id(&conn, user.id)?.ok_or(Error::UserNotFound)?;
    Ok(LoginOutcome::Authenticated(user.auth_info()))
}
