//! # Key Manager
//!
//! Mints per-chat symmetric keys and stores one RSA-OAEP wrapped copy per
//! joined member. The unwrapped key exists only in memory for the duration
//! of [`mint_chat_key`].
//!
//! ```text
//! mint_chat_key(tx, chat)
//!   1. lock chat row
//!   2. version = max(version) + 1
//!   3. key = 32 random bytes
//!   4. for each joined member: wrap(member.public_key, key) → chat_keys
//!   5. any member without a public key → MissingPublicKey, nothing written
//! ```

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use cloak_core::crypto::encoding;
use cloak_core::protocol::{ChatId, KeyVersion, UserId};
use cloak_core::{ChatKey, Error, PublicIdentityKey, Result};

use crate::storage::database::{db_err, now_millis};
use crate::storage::Database;

/// Mint a new key version for `chat_id` inside the caller's transaction.
///
/// On error the caller must drop the transaction; rows inserted before the
/// failure are rolled back with it.
pub fn mint_chat_key(tx: &Transaction<'_>, chat_id: ChatId) -> Result<KeyVersion> {
    // No-op write: takes the row lock and proves the chat exists.
    let locked = tx
        .execute("UPDATE chats SET id = id WHERE id = ?", params![chat_id])
        .map_err(db_err("Failed to lock chat"))?;
    if locked == 0 {
        return Err(Error::ChatNotFound);
    }

    let version = latest_version(tx, chat_id)?.unwrap_or(0) + 1;

    let members: Vec<(UserId, Option<String>)> = {
        let mut stmt = tx
            .prepare(
                "SELECT u.id, u.public_key FROM chat_members m
                 JOIN users u ON u.id = m.user_id
                 WHERE m.chat_id = ? AND m.is_joined = 1
                 ORDER BY u.id",
            )
            .map_err(db_err("Failed to prepare member query"))?;
        let rows = stmt
            .query_map(params![chat_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err("Failed to query members"))?;
        rows.collect::<rusqlite::Result<_>>()
            .map_err(db_err("Failed to read members"))?
    };

    let chat_key = ChatKey::generate();
    let created_at = now_millis();
    for (user_id, public_key) in &members {
        let public_key = public_key
            .as_deref()
            .ok_or(Error::MissingPublicKey { user_id: *user_id })?;
        let wrapped = PublicIdentityKey::from_base64(public_key)?.wrap_key(&chat_key)?;

        tx.execute(
            "INSERT INTO chat_keys (chat_id, user_id, version, encrypted_key, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![chat_id, user_id, version, encoding::encode(&wrapped), created_at],
        )
        .map_err(db_err("Failed to store chat key"))?;
    }

    tracing::info!(chat_id, version, members = members.len(), "Minted chat key");
    Ok(version)
}

/// Highest key version minted for a chat.
pub fn latest_version(conn: &Connection, chat_id: ChatId) -> Result<Option<KeyVersion>> {
    conn.query_row(
        "SELECT MAX(version) FROM chat_keys WHERE chat_id = ?",
        params![chat_id],
        |row| row.get(0),
    )
    .map_err(db_err("Failed to get latest key version"))
}

/// A member's newest wrapped key: `(version, encrypted_key)`.
pub fn latest_member_key(conn: &Connection, chat_id: ChatId, user_id: UserId) -> Result<Option<(KeyVersion, String)>> {
    conn.query_row(
        "SELECT version, encrypted_key FROM chat_keys
         WHERE chat_id = ? AND user_id = ?
         ORDER BY version DESC LIMIT 1",
        params![chat_id, user_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(db_err("Failed to get chat key"))
}

/// A member's wrapped key at one version.
pub fn member_key(conn: &Connection, chat_id: ChatId, user_id: UserId, version: KeyVersion) -> Result<Option<String>> {
    conn.query_row(
        "SELECT encrypted_key FROM chat_keys WHERE chat_id = ? AND user_id = ? AND version = ?",
        params![chat_id, user_id, version],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err("Failed to get chat key"))
}

/// `get_chat_key`: the caller's wrapped key for `(chat_id, version)`.
///
/// Any member row (joined or not) may read keys so that old history stays
/// readable.
pub fn get_chat_key(db: &Database, chat_id: ChatId, user_id: UserId, version: KeyVersion) -> Result<String> {
    let conn = db.connect()?;
    if !crate::directory::is_member(&conn, chat_id, user_id)? {
        return Err(Error::NotMember);
    }
    member_key(&conn, chat_id, user_id, version)?
        .ok_or_else(|| Error::KeyNotFound(format!("chat {} version {}", chat_id, version)))
}
