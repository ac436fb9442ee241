//! Shared fixtures for unit tests.

use std::sync::OnceLock;
use std::time::Duration;

use rusqlite::params;

use cloak_core::crypto::encoding;
use cloak_core::protocol::UserId;
use cloak_core::IdentityKeyPair;

use crate::storage::Database;

pub(crate) fn temp_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("cloak.db"), Duration::from_secs(5)).unwrap();
    (dir, db)
}

/// A small pool of RSA key pairs, generated once per test binary.
pub(crate) fn keypair(index: usize) -> &'static IdentityKeyPair {
    static KEYS: OnceLock<Vec<IdentityKeyPair>> = OnceLock::new();
    &KEYS.get_or_init(|| {
        (0..3)
            .map(|_| IdentityKeyPair::generate().unwrap())
            .collect()
    })[index]
}

/// A user with no key pair yet.
pub(crate) fn add_user(db: &Database, username: &str) -> UserId {
    db.create_user(username, username, "not-a-real-hash").unwrap()
}

/// A user whose public key is `keypair(key_index)`.
pub(crate) fn add_keyed_user(db: &Database, username: &str, key_index: usize) -> UserId {
    let id = add_user(db, username);
    let public_key = keypair(key_index).public_key().to_base64().unwrap();
    db.connect()
        .unwrap()
        .execute(
            "UPDATE users SET public_key = ?, encrypted_private_key = ?, iv = ?, key_salt = ? WHERE id = ?",
            params![public_key, encoding::encode(b"opaque"), vec![0u8; 12], vec![0u8; 16], id],
        )
        .unwrap();
    id
}
