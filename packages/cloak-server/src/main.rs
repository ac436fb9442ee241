//! Cloak server binary.
//!
//! `cloak-server` serves the WebSocket API. `cloak-server add-user` seeds an
//! account without key material; its first login then bootstraps the keys.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use cloak_server::storage::Database;
use cloak_server::{auth, AppState, ServerConfig};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cloak-server", version, about = "Cloak end-to-end encrypted chat server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "CLOAK_PORT")]
    port: u16,

    /// SQLite database file
    #[arg(long, default_value = "cloak.db", env = "CLOAK_DATABASE")]
    database: PathBuf,

    /// Maximum messages returned by one history page
    #[arg(long, default_value_t = 50, env = "CLOAK_HISTORY_LIMIT")]
    history_limit: u32,

    /// Maximum chats returned by get_home
    #[arg(long, default_value_t = 15, env = "CLOAK_HOME_LIMIT")]
    home_limit: u32,

    /// How long a write waits for the database lock, in milliseconds
    #[arg(long, default_value_t = 5000, env = "CLOAK_BUSY_TIMEOUT_MS")]
    busy_timeout_ms: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "CLOAK_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account with an initial password
    AddUser {
        username: String,
        /// Display name (defaults to the username)
        #[arg(long)]
        name: Option<String>,
        #[arg(long, env = "CLOAK_INITIAL_PASSWORD")]
        password: String,
    },
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            database_path: self.database.clone(),
            history_limit: self.history_limit,
            home_limit: self.home_limit,
            busy_timeout_ms: self.busy_timeout_ms,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cloak_server=info,tower_http=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    let result = match &args.command {
        Some(Command::AddUser {
            username,
            name,
            password,
        }) => add_user(&args.config(), username, name.as_deref().unwrap_or(username), password),
        None => run(args.config()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), String> {
    let addr = format!("0.0.0.0:{}", config.port);
    let state = AppState::open(config).map_err(|e| format!("Failed to open database: {}", e))?;

    tracing::info!(
        database = %state.db.path().display(),
        "Cloak server starting on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

    cloak_server::serve(listener, state)
        .await
        .map_err(|e| format!("Server error: {}", e))
}

fn add_user(config: &ServerConfig, username: &str, name: &str, password: &str) -> Result<(), String> {
    let db = Database::open(
        &config.database_path,
        std::time::Duration::from_millis(config.busy_timeout_ms),
    )
    .map_err(|e| e.to_string())?;
    let hash = auth::hash_password(password).map_err(|e| e.to_string())?;
    let id = db.create_user(name, username, &hash).map_err(|e| e.to_string())?;
    tracing::info!(user_id = id, username, "User created");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["cloak-server"]);
        let config = args.config();
        assert_eq!(config.port, 8080);
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.home_limit, 15);
        assert_eq!(config.database_path, PathBuf::from("cloak.db"));
        assert!(args.command.is_none());
    }

    #[test]
    fn test_add_user_command() {
        let args = Args::parse_from([
            "cloak-server",
            "--database",
            "/tmp/x.db",
            "add-user",
            "alice",
            "--password",
            "pw",
        ]);
        match args.command {
            Some(Command::AddUser {
                username,
                name,
                password,
            }) => {
                assert_eq!(username, "alice");
                assert!(name.is_none());
                assert_eq!(password, "pw");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_add_user_writes_account() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            database_path: dir.path().join("cli.db"),
            ..ServerConfig::default()
        };
        add_user(&config, "alice", "Alice", "pw").unwrap();
        assert!(add_user(&config, "alice", "Alice", "pw").is_err());

        let db = Database::open(&config.database_path, std::time::Duration::from_secs(1)).unwrap();
        let user = db.user_by_username("alice").unwrap().unwrap();
        assert_eq!(user.name, "Alice");
    }
}
