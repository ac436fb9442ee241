//! # Database
//!
//! SQLite handle for the server.
//!
//! ```text
//! ┌─────────────────┐
//! │   Directory /   │  find-or-create, key minting, append
//! │ Keys / Ledger   │  (each call runs on a blocking thread)
//! └────────┬────────┘
//!          │ Database::connect()
//!          ▼
//! ┌─────────────────┐
//! │    rusqlite     │  one connection per call
//! │                 │  WAL, foreign keys, busy timeout
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │   SQLite file   │  BEGIN IMMEDIATE takes the write lock
//! └─────────────────┘
//! ```
//!
//! Every operation opens its own connection, so concurrent requests never
//! share one. Write paths use `BEGIN IMMEDIATE`; SQLite then admits one
//! writer at a time and the others wait up to the busy timeout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use cloak_core::protocol::{AuthInfo, UserId, UserResource};
use cloak_core::{Error, Result};

use super::schema;

/// Map a rusqlite error into [`Error::DatabaseError`] with some context.
pub(crate) fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::DatabaseError(format!("{}: {}", context, e))
}

/// Current time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a stored epoch-millisecond column back to a timestamp.
pub(crate) fn millis_to_datetime(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

/// A user row.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub username: String,
    pub password_hash: String,
    pub public_key: Option<String>,
    pub encrypted_private_key: Option<String>,
    pub iv: Option<Vec<u8>>,
    pub key_salt: Option<Vec<u8>>,
}

impl UserRecord {
    pub fn auth_info(&self) -> AuthInfo {
        AuthInfo {
            id: self.id,
            name: self.name.clone(),
            username: self.username.clone(),
            public_key: self.public_key.clone(),
            encrypted_private_key: self.encrypted_private_key.clone(),
            iv: self.iv.clone(),
            key_salt: self.key_salt.clone(),
        }
    }

    pub fn resource(&self) -> UserResource {
        UserResource {
            id: self.id,
            name: self.name.clone(),
            username: self.username.clone(),
        }
    }
}

const USER_COLUMNS: &str =
    "id, name, username, password_hash, public_key, encrypted_private_key, iv, key_salt";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        username: row.get(2)?,
        password_hash: row.get(3)?,
        public_key: row.get(4)?,
        encrypted_private_key: row.get(5)?,
        iv: row.get(6)?,
        key_salt: row.get(7)?,
    })
}

/// Look up a user by login name.
pub fn user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE username = ?", USER_COLUMNS),
        params![username],
        user_from_row,
    )
    .optional()
    .map_err(db_err("Failed to get user"))
}

/// Look up a user by id.
pub fn user_by_id(conn: &Connection, id: UserId) -> Result<Option<UserRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
        params![id],
        user_from_row,
    )
    .optional()
    .map_err(db_err("Failed to get user"))
}

/// Server database configuration and connection factory.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open or create the database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        };

        let conn = db.connect()?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(db_err("Failed to enable WAL"))?;
        tracing::debug!(journal_mode = mode.as_str(), "Database opened");

        Self::init_schema(&conn)?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new connection for one operation.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(db_err("Failed to open database"))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(db_err("Failed to set busy timeout"))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(db_err("Failed to enable foreign keys"))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(db_err("Failed to create tables"))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(db_err("Failed to set schema version"))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v == schema::SCHEMA_VERSION => {
                tracing::debug!("Database schema is current (version {})", v);
            }
            Some(v) => {
                return Err(Error::DatabaseError(format!(
                    "Unsupported schema version {} (expected {})",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
        }
        Ok(())
    }

    /// Insert a user without key material. Registration proper lives outside
    /// this server; this backs the `add-user` command and tests.
    pub fn create_user(&self, name: &str, username: &str, password_hash: &str) -> Result<UserId> {
        let conn = self.connect()?;
        let result = conn.execute(
            "INSERT INTO users (name, username, password_hash, created_at) VALUES (?, ?, ?, ?)",
            params![name, username, password_hash, now_millis()],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::InvalidRequest(format!("Username '{}' is taken", username)))
            }
            Err(e) => Err(Error::DatabaseError(format!("Failed to create user: {}", e))),
        }
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        user_by_username(&self.connect()?, username)
    }

    pub fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>> {
        user_by_id(&self.connect()?, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db;

    #[test]
    fn test_open_creates_schema() {
        let (_dir, db) = temp_db();
        let conn = db.connect().unwrap();
        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_existing_database() {
        let (dir, _db) = temp_db();
        let reopened = Database::open(dir.path().join("cloak.db"), Duration::from_secs(5));
        assert!(reopened.is_ok());
    }

    #[test]
    fn test_create_and_get_user() {
        let (_dir, db) = temp_db();
        let id = db.create_user("Alice", "alice", "hash").unwrap();
        assert!(id > 0);

        let user = db.user_by_username("alice").unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.name, "Alice");
        assert!(user.public_key.is_none());

        let by_id = db.user_by_id(id).unwrap().unwrap();
        assert_eq!(by_id.resource().username, "alice");
        assert!(!by_id.auth_info().is_bootstrapped());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let (_dir, db) = temp_db();
        db.create_user("Alice", "alice", "hash").unwrap();
        let result = db.create_user("Other", "alice", "hash");
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_missing_user() {
        let (_dir, db) = temp_db();
        assert!(db.user_by_username("nobody").unwrap().is_none());
        assert!(db.user_by_id(42).unwrap().is_none());
    }

    #[test]
    fn test_key_columns_set_together() {
        let (_dir, db) = temp_db();
        let id = db.create_user("Alice", "alice", "hash").unwrap();
        let conn = db.connect().unwrap();
        let result = conn.execute(
            "UPDATE users SET public_key = 'pk' WHERE id = ?",
            params![id],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = millis_to_datetime(now.timestamp_millis()).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
