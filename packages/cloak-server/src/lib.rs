//! Cloak chat server
//!
//! A WebSocket server for end-to-end encrypted two-party chat:
//!
//! 1. **Accounts**: password login, plus a one-time bootstrap that stores the
//!    user's RSA public key and password-protected private key.
//!
//! 2. **Chat directory**: find-or-create of private chats, safe against two
//!    users creating the same chat at once.
//!
//! 3. **Key manager**: mints each chat key and stores one copy wrapped for
//!    every member's public key.
//!
//! 4. **Message ledger**: append-only ciphertext history with membership and
//!    key-version checks.
//!
//! 5. **Fan-out**: live `chat_message`, `activity` and `chat_created` events
//!    to subscribed connections.
//!
//! **Privacy**: the server never sees plaintext or unwrapped keys. All
//! encryption happens in the client (see `cloak-core`).

pub mod auth;
pub mod directory;
pub mod handler;
pub mod hub;
pub mod keys;
pub mod ledger;
pub mod rooms;
pub mod session;
pub mod state;
pub mod storage;

#[cfg(test)]
mod test_support;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{AppState, ServerConfig};

/// Build the HTTP router: `/ws` for clients plus health and stats.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

// ── Route Handlers ────────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "cloak-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "online_connections": state.online_count(),
        "active_scopes": state.hub.scope_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_and_stats_over_http() {
        let (_dir, db) = test_support::temp_db();
        let state = AppState::new(db, ServerConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("\"service\":\"cloak-server\""));
    }
}
