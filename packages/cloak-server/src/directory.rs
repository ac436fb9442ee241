//! # Chat Directory
//!
//! Race-safe find-or-create of private chats, plus the read-side lookups
//! used by `open_chat` and `get_home`.
//!
//! ## Find or Create
//!
//! ```text
//! BEGIN IMMEDIATE
//!   lock users (ascending id)          ── UserNotFound if either is missing
//!   find chat with both joined         ── found: return it, no new keys
//!   insert chat + two members
//!   mint key version 1                 ── MissingPublicKey aborts everything
//! COMMIT
//! ```
//!
//! Two concurrent calls (A→B and B→A) serialize on the write lock taken at
//! `BEGIN`; the second one then sees the first one's chat.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use cloak_core::protocol::{ChatId, ChatKind, ChatResource, HomeChatResource, UserId, UserResource};
use cloak_core::{Error, Result};

use crate::keys;
use crate::ledger;
use crate::storage::database::{db_err, now_millis};
use crate::storage::Database;

/// Outcome of [`find_or_create_private_chat`].
#[derive(Debug, Clone)]
pub struct PrivateChat {
    /// The chat as seen by the caller
    pub chat: ChatResource,
    /// Whether this call created it
    pub created: bool,
}

pub fn find_or_create_private_chat(db: &Database, caller: UserId, other: UserId) -> Result<PrivateChat> {
    if caller == other {
        return Err(Error::InvalidRequest("Cannot open a private chat with yourself".into()));
    }

    let mut conn = db.connect()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("Failed to begin transaction"))?;

    let (low, high) = if caller < other { (caller, other) } else { (other, caller) };
    for user_id in [low, high] {
        let locked = tx
            .execute("UPDATE users SET id = id WHERE id = ?", params![user_id])
            .map_err(db_err("Failed to lock user"))?;
        if locked == 0 {
            return Err(Error::UserNotFound);
        }
    }

    let (chat_id, created) = match find_private_chat(&tx, caller, other)? {
        Some(chat_id) => (chat_id, false),
        None => {
            let now = now_millis();
            tx.execute(
                "INSERT INTO chats (kind, created_at) VALUES (?, ?)",
                params![ChatKind::Private.as_str(), now],
            )
            .map_err(db_err("Failed to create chat"))?;
            let chat_id = tx.last_insert_rowid();

            for user_id in [caller, other] {
                tx.execute(
                    "INSERT INTO chat_members (chat_id, user_id, is_joined, joined_at) VALUES (?, ?, 1, ?)",
                    params![chat_id, user_id, now],
                )
                .map_err(db_err("Failed to add chat member"))?;
            }

            keys::mint_chat_key(&tx, chat_id)?;
            (chat_id, true)
        }
    };

    let chat = chat_resource(&tx, chat_id, caller)?;
    tx.commit().map_err(db_err("Failed to commit chat"))?;

    if created {
        tracing::info!(chat_id, caller, other, "Created private chat");
    }
    Ok(PrivateChat { chat, created })
}

/// The private chat whose joined members include both users.
pub fn find_private_chat(conn: &Connection, a: UserId, b: UserId) -> Result<Option<ChatId>> {
    conn.query_row(
        "SELECT c.id FROM chats c
         JOIN chat_members m ON m.chat_id = c.id
         WHERE c.kind = 'private' AND m.is_joined = 1 AND m.user_id IN (?1, ?2)
         GROUP BY c.id
         HAVING COUNT(DISTINCT m.user_id) >= 2
         ORDER BY c.id
         LIMIT 1",
        params![a, b],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err("Failed to find private chat"))
}

/// `open_chat`: the existing private chat with `other`, if any.
pub fn open_private_chat(db: &Database, caller: UserId, other: UserId) -> Result<Option<ChatResource>> {
    let conn = db.connect()?;
    if crate::storage::database::user_by_id(&conn, other)?.is_none() {
        return Err(Error::UserNotFound);
    }
    match find_private_chat(&conn, caller, other)? {
        Some(chat_id) => chat_resource(&conn, chat_id, caller).map(Some),
        None => Ok(None),
    }
}

/// A chat as seen by `viewer`: kind, the viewer's newest wrapped key and,
/// for private chats, the other member.
pub fn chat_resource(conn: &Connection, chat_id: ChatId, viewer: UserId) -> Result<ChatResource> {
    let kind: String = conn
        .query_row("SELECT kind FROM chats WHERE id = ?", params![chat_id], |row| row.get(0))
        .optional()
        .map_err(db_err("Failed to get chat"))?
        .ok_or(Error::ChatNotFound)?;
    let kind = ChatKind::parse(&kind)
        .ok_or_else(|| Error::DatabaseError(format!("Unknown chat kind '{}'", kind)))?;

    let (version, encrypted_chat_key) = keys::latest_member_key(conn, chat_id, viewer)?
        .ok_or_else(|| Error::KeyNotFound(format!("chat {}", chat_id)))?;

    let user = match kind {
        ChatKind::Private => other_member(conn, chat_id, viewer)?,
        _ => None,
    };

    Ok(ChatResource {
        id: chat_id,
        kind,
        encrypted_chat_key,
        version,
        user,
    })
}

fn other_member(conn: &Connection, chat_id: ChatId, viewer: UserId) -> Result<Option<UserResource>> {
    conn.query_row(
        "SELECT u.id, u.name, u.username FROM chat_members m
         JOIN users u ON u.id = m.user_id
         WHERE m.chat_id = ? AND m.user_id != ?
         LIMIT 1",
        params![chat_id, viewer],
        |row| {
            Ok(UserResource {
                id: row.get(0)?,
                name: row.get(1)?,
                username: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(db_err("Failed to get chat member"))
}

/// Whether `user_id` has a member row in the chat, joined or not.
pub fn is_member(conn: &Connection, chat_id: ChatId, user_id: UserId) -> Result<bool> {
    Ok(membership(conn, chat_id, user_id)?.is_some())
}

/// `Some(is_joined)` for members, `None` otherwise.
pub fn membership(conn: &Connection, chat_id: ChatId, user_id: UserId) -> Result<Option<bool>> {
    conn.query_row(
        "SELECT is_joined FROM chat_members WHERE chat_id = ? AND user_id = ?",
        params![chat_id, user_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err("Failed to get membership"))
}

/// Ids of the chat's joined members.
pub fn joined_member_ids(conn: &Connection, chat_id: ChatId) -> Result<Vec<UserId>> {
    let mut stmt = conn
        .prepare("SELECT user_id FROM chat_members WHERE chat_id = ? AND is_joined = 1 ORDER BY user_id")
        .map_err(db_err("Failed to prepare member query"))?;
    let ids = stmt
        .query_map(params![chat_id], |row| row.get(0))
        .map_err(db_err("Failed to query members"))?
        .collect::<rusqlite::Result<Vec<UserId>>>()
        .map_err(db_err("Failed to read members"))?;
    Ok(ids)
}

/// `get_home`: the user's joined chats, most recent activity first, each
/// with its last message.
pub fn home(db: &Database, user_id: UserId, limit: u32) -> Result<Vec<HomeChatResource>> {
    let conn = db.connect()?;
    let chat_ids: Vec<ChatId> = {
        let mut stmt = conn
            .prepare(
                "SELECT c.id FROM chats c
                 JOIN chat_members m ON m.chat_id = c.id
                 WHERE m.user_id = ?1 AND m.is_joined = 1
                 ORDER BY COALESCE((SELECT MAX(created_at) FROM messages WHERE chat_id = c.id), c.created_at) DESC,
                          c.id DESC
                 LIMIT ?2",
            )
            .map_err(db_err("Failed to prepare home query"))?;
        let ids = stmt
            .query_map(params![user_id, limit], |row| row.get(0))
            .map_err(db_err("Failed to query home"))?
            .collect::<rusqlite::Result<Vec<ChatId>>>()
            .map_err(db_err("Failed to read home"))?;
        ids
    };

    chat_ids
        .into_iter()
        .map(|chat_id| {
            Ok(HomeChatResource {
                chat: chat_resource(&conn, chat_id, user_id)?,
                last_message: ledger::last_message(&conn, chat_id)?,
            })
        })
        .collect()
}
