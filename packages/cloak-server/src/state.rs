//! Server state management.
//!
//! Everything a connection handler needs: the database handle, the fan-out
//! hub and the configuration. Cloned into every connection task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloak_core::Result;

use crate::hub::Hub;
use crate::ledger::DEFAULT_PAGE_SIZE;
use crate::storage::Database;

/// Default number of chats returned by `get_home`.
const DEFAULT_HOME_LIMIT: u32 = 15;

/// Default SQLite busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_path: PathBuf,
    /// Upper bound for one `get_chat_messages` page
    pub history_limit: u32,
    pub home_limit: u32,
    pub busy_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database_path: PathBuf::from("cloak.db"),
            history_limit: DEFAULT_PAGE_SIZE,
            home_limit: DEFAULT_HOME_LIMIT,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub hub: Hub,
    pub config: Arc<ServerConfig>,
    connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Open the configured database and build the state around it.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let db = Database::open(
            &config.database_path,
            Duration::from_millis(config.busy_timeout_ms),
        )?;
        Ok(Self::new(db, config))
    }

    pub fn new(db: Database, config: ServerConfig) -> Self {
        Self {
            db,
            hub: Hub::new(),
            config: Arc::new(config),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of open WebSocket connections.
    pub fn online_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_db;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.home_limit, 15);
        assert_eq!(config.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_connection_counter() {
        let (_dir, db) = temp_db();
        let state = AppState::new(db, ServerConfig::default());
        let clone = state.clone();

        state.connection_opened();
        clone.connection_opened();
        assert_eq!(state.online_count(), 2);

        clone.connection_closed();
        assert_eq!(state.online_count(), 1);
    }

    #[test]
    fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            database_path: dir.path().join("state.db"),
            ..ServerConfig::default()
        };
        let state = AppState::open(config).unwrap();
        assert!(state.db.path().exists());
        assert_eq!(state.hub.scope_count(), 0);
    }
}
