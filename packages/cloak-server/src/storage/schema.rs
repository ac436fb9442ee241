//! # Database Schema
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌───────────────────────┐        ┌─────────────────┐                   │
//! │  │        users          │        │      chats      │                   │
//! │  ├───────────────────────┤        ├─────────────────┤                   │
//! │  │ id                    │◄──┐    │ id              │◄──┐               │
//! │  │ name                  │   │    │ kind            │   │               │
//! │  │ username (unique)     │   │    │ created_at      │   │               │
//! │  │ password_hash         │   │    └─────────────────┘   │               │
//! │  │ public_key            │   │                          │               │
//! │  │ encrypted_private_key │   │    ┌─────────────────┐   │               │
//! │  │ iv, key_salt          │   ├────│  chat_members   │───┤               │
//! │  └───────────────────────┘   │    │ (chat, user)    │   │               │
//! │                              │    │ is_joined       │   │               │
//! │                              │    └─────────────────┘   │               │
//! │                              │    ┌─────────────────┐   │               │
//! │                              ├────│   chat_keys     │───┤               │
//! │                              │    │ (chat, user,    │   │               │
//! │                              │    │  version)       │   │               │
//! │                              │    │ encrypted_key   │   │               │
//! │                              │    └─────────────────┘   │               │
//! │                              │    ┌─────────────────┐   │               │
//! │                              └────│    messages     │───┘               │
//! │                                   │ id, ciphertext  │                   │
//! │                                   │ iv, version     │                   │
//! │                                   └─────────────────┘                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Users. Key material is set once, all columns together.
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    username TEXT NOT NULL UNIQUE,
    -- Argon2id PHC string
    password_hash TEXT NOT NULL,
    -- base64 SPKI
    public_key TEXT,
    -- base64 AES-GCM ciphertext of the PKCS#8 private key
    encrypted_private_key TEXT,
    iv BLOB,
    key_salt BLOB,
    created_at INTEGER NOT NULL,
    CHECK ((public_key IS NULL) = (encrypted_private_key IS NULL))
);

-- Chats
CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL CHECK (kind IN ('private', 'group', 'channel')),
    created_at INTEGER NOT NULL
);

-- Chat membership
CREATE TABLE IF NOT EXISTS chat_members (
    chat_id INTEGER NOT NULL REFERENCES chats(id),
    user_id INTEGER NOT NULL REFERENCES users(id),
    is_joined INTEGER NOT NULL DEFAULT 1,
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (chat_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_chat_members_user ON chat_members(user_id);

-- One wrapped copy of each chat key version per member. Append-only.
CREATE TABLE IF NOT EXISTS chat_keys (
    chat_id INTEGER NOT NULL REFERENCES chats(id),
    user_id INTEGER NOT NULL REFERENCES users(id),
    version INTEGER NOT NULL,
    -- base64 RSA-OAEP ciphertext
    encrypted_key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (chat_id, user_id, version)
);

-- Messages. Append-only; the server stores ciphertext only.
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL REFERENCES chats(id),
    sender_id INTEGER NOT NULL REFERENCES users(id),
    ciphertext TEXT NOT NULL,
    iv BLOB NOT NULL,
    chat_key_version INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, id);
"#;
