//! # Message Ledger
//!
//! Append-only store of encrypted messages. The server checks membership
//! and key freshness but never looks inside `ciphertext`.
//!
//! ## Append checks (in order)
//!
//! | Check                                   | Error         |
//! |-----------------------------------------|---------------|
//! | sender is a joined member               | `NotMember`   |
//! | claimed version is the latest minted    | `StaleKey`    |
//! | sender holds a key at that version      | `KeyNotFound` |

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use cloak_core::protocol::{ChatId, KeyVersion, MessageId, MessageResource, UserId, UserResource};
use cloak_core::{Error, Result};

use crate::directory;
use crate::keys;
use crate::storage::database::{db_err, millis_to_datetime, now_millis};
use crate::storage::Database;

/// Default page size for history reads.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

const MESSAGE_COLUMNS: &str = "m.id, m.chat_id, m.ciphertext, m.iv, m.chat_key_version, m.created_at,
     u.id, u.name, u.username";

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageResource> {
    Ok(MessageResource {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        ciphertext: row.get(2)?,
        iv: row.get(3)?,
        chat_key_version: row.get(4)?,
        created_at: millis_to_datetime(row.get(5)?)?,
        sender: UserResource {
            id: row.get(6)?,
            name: row.get(7)?,
            username: row.get(8)?,
        },
    })
}

/// `send_message`: store one ciphertext from `sender`.
pub fn append(
    db: &Database,
    chat_id: ChatId,
    sender: UserId,
    ciphertext: &str,
    iv: &[u8],
    version: KeyVersion,
) -> Result<MessageResource> {
    let mut conn = db.connect()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err("Failed to begin transaction"))?;

    if directory::membership(&tx, chat_id, sender)? != Some(true) {
        return Err(Error::NotMember);
    }

    let latest = keys::latest_version(&tx, chat_id)?.unwrap_or(0);
    if latest > version {
        tracing::debug!(chat_id, version, latest, "Rejected stale key version");
        return Err(Error::StaleKey);
    }
    if keys::member_key(&tx, chat_id, sender, version)?.is_none() {
        return Err(Error::KeyNotFound(format!("chat {} version {}", chat_id, version)));
    }

    tx.execute(
        "INSERT INTO messages (chat_id, sender_id, ciphertext, iv, chat_key_version, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![chat_id, sender, ciphertext, iv, version, now_millis()],
    )
    .map_err(db_err("Failed to store message"))?;
    let id = tx.last_insert_rowid();

    let message = message_by_id(&tx, id)?.ok_or_else(|| Error::Internal("Stored message vanished".into()))?;
    tx.commit().map_err(db_err("Failed to commit message"))?;

    tracing::debug!(chat_id, message_id = id, version, "Message appended");
    Ok(message)
}

/// `get_chat_messages`: up to `limit` messages before `before_id`, oldest
/// first.
pub fn list(
    db: &Database,
    chat_id: ChatId,
    viewer: UserId,
    limit: u32,
    before_id: Option<MessageId>,
) -> Result<Vec<MessageResource>> {
    let conn = db.connect()?;
    if !directory::is_member(&conn, chat_id, viewer)? {
        return Err(Error::NotMember);
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM messages m JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = ?1 AND (?2 IS NULL OR m.id < ?2)
             ORDER BY m.id DESC
             LIMIT ?3",
            MESSAGE_COLUMNS
        ))
        .map_err(db_err("Failed to prepare history query"))?;
    let mut messages = stmt
        .query_map(params![chat_id, before_id, limit], message_from_row)
        .map_err(db_err("Failed to query history"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err("Failed to read history"))?;

    messages.reverse();
    Ok(messages)
}

/// Newest message in a chat.
pub fn last_message(conn: &Connection, chat_id: ChatId) -> Result<Option<MessageResource>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM messages m JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = ? ORDER BY m.id DESC LIMIT 1",
            MESSAGE_COLUMNS
        ),
        params![chat_id],
        message_from_row,
    )
    .optional()
    .map_err(db_err("Failed to get last message"))
}

fn message_by_id(conn: &Connection, id: MessageId) -> Result<Option<MessageResource>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM messages m JOIN users u ON u.id = m.sender_id WHERE m.id = ?",
            MESSAGE_COLUMNS
        ),
        params![id],
        message_from_row,
    )
    .optional()
    .map_err(db_err("Failed to get message"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::find_or_create_private_chat;
    use crate::test_support::{add_keyed_user, temp_db};
    use cloak_core::crypto::encoding;

    fn body(n: u8) -> String {
        encoding::encode(&[n; 32])
    }

    fn setup() -> (tempfile::TempDir, Database, UserId, UserId, ChatId) {
        let (dir, db) = temp_db();
        let alice = add_keyed_user(&db, "alice", 0);
        let bob = add_keyed_user(&db, "bob", 1);
        let chat = find_or_create_private_chat(&db, alice, bob).unwrap().chat;
        (dir, db, alice, bob, chat.id)
    }

    #[test]
    fn test_append_and_list() {
        let (_dir, db, alice, bob, chat_id) = setup();
        let stored = append(&db, chat_id, alice, &body(1), &[7; 12], 1).unwrap();
        assert_eq!(stored.sender.id, alice);
        assert_eq!(stored.chat_key_version, 1);
        assert_eq!(stored.iv, vec![7; 12]);

        let history = list(&db, chat_id, bob, DEFAULT_PAGE_SIZE, None).unwrap();
        assert_eq!(history, vec![stored]);
    }

    #[test]
    fn test_history_is_oldest_first_and_capped() {
        let (_dir, db, alice, bob, chat_id) = setup();
        let ids: Vec<MessageId> = (0..60)
            .map(|i| append(&db, chat_id, if i % 2 == 0 { alice } else { bob }, &body(i), &[0; 12], 1).unwrap().id)
            .collect();

        let page = list(&db, chat_id, alice, DEFAULT_PAGE_SIZE, None).unwrap();
        assert_eq!(page.len(), 50);
        assert_eq!(page.first().unwrap().id, ids[10]);
        assert_eq!(page.last().unwrap().id, ids[59]);
        assert!(page.windows(2).all(|w| w[0].id < w[1].id));

        let older = list(&db, chat_id, alice, DEFAULT_PAGE_SIZE, Some(ids[10])).unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..10].to_vec());
    }

    #[test]
    fn test_stale_key_rejected_after_rotation() {
        let (_dir, db, alice, _bob, chat_id) = setup();

        let mut conn = db.connect().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).unwrap();
        keys::mint_chat_key(&tx, chat_id).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            append(&db, chat_id, alice, &body(1), &[0; 12], 1).unwrap_err(),
            Error::StaleKey
        );
        assert!(append(&db, chat_id, alice, &body(1), &[0; 12], 2).is_ok());
    }

    #[test]
    fn test_future_version_has_no_key() {
        let (_dir, db, alice, _bob, chat_id) = setup();
        assert!(matches!(
            append(&db, chat_id, alice, &body(1), &[0; 12], 5),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_non_member_cannot_read_or_write() {
        let (_dir, db, _alice, _bob, chat_id) = setup();
        let eve = add_keyed_user(&db, "eve", 2);
        assert_eq!(
            append(&db, chat_id, eve, &body(1), &[0; 12], 1).unwrap_err(),
            Error::NotMember
        );
        assert_eq!(list(&db, chat_id, eve, 10, None).unwrap_err(), Error::NotMember);
    }

    #[test]
    fn test_left_member_reads_but_cannot_write() {
        let (_dir, db, alice, bob, chat_id) = setup();
        append(&db, chat_id, alice, &body(1), &[0; 12], 1).unwrap();
        db.connect()
            .unwrap()
            .execute(
                "UPDATE chat_members SET is_joined = 0 WHERE chat_id = ? AND user_id = ?",
                params![chat_id, bob],
            )
            .unwrap();

        assert_eq!(list(&db, chat_id, bob, 10, None).unwrap().len(), 1);
        assert_eq!(
            append(&db, chat_id, bob, &body(2), &[0; 12], 1).unwrap_err(),
            Error::NotMember
        );
    }

    #[test]
    fn test_last_message() {
        let (_dir, db, alice, _bob, chat_id) = setup();
        let conn = db.connect().unwrap();
        assert!(last_message(&conn, chat_id).unwrap().is_none());

        append(&db, chat_id, alice, &body(1), &[0; 12], 1).unwrap();
        let second = append(&db, chat_id, alice, &body(2), &[0; 12], 1).unwrap();
        assert_eq!(last_message(&conn, chat_id).unwrap(), Some(second));
    }
}
