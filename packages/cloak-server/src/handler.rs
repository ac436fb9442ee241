//! WebSocket connection handler.
//!
//! One task per connection. Inbound frames are handled in order; each gets
//! exactly one response frame. Events published by other connections reach
//! this socket through the same outbound channel.
//!
//! Storage calls are synchronous SQLite work and run on the blocking pool.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use cloak_core::protocol::{
    ActivityUpdate, ClientFrame, Event, Request, ServerFrame, PROTOCOL_VERSION,
};
use cloak_core::{Error, Result};

use crate::auth::{self, LoginOutcome};
use crate::directory;
use crate::keys;
use crate::ledger;
use crate::rooms::Scope;
use crate::session::Session;
use crate::state::AppState;
use crate::storage::Database;

/// Handle a single WebSocket connection until it closes.
pub async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut session = Session::new(state.hub.next_connection_id(), tx.clone());
    let conn = session.conn_id();

    state.connection_opened();
    tracing::info!(conn, "WebSocket connected");

    // ── Sender Task ───────────────────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server frame: {}", e);
                }
            }
        }
    });

    // ── Process Frames ────────────────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let reply = handle_text(&state, &mut session, &text).await;
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(conn, error = %e, "WebSocket error");
                break;
            }
            // Ping is answered by axum; binary frames are not part of the protocol.
            _ => {}
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    session.release(&state.hub);
    state.connection_closed();
    sender_task.abort();
    tracing::info!(conn, "WebSocket disconnected");
}

/// Parse one text frame and produce its response.
async fn handle_text(state: &AppState, session: &mut Session, text: &str) -> ServerFrame {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(conn = session.conn_id(), error = %e, "Failed to parse client frame");
            return ServerFrame::err(
                salvage_id(text),
                &Error::InvalidRequest(format!("Invalid frame: {}", e)),
            );
        }
    };

    if frame.v != PROTOCOL_VERSION {
        return ServerFrame::err(
            frame.id,
            &Error::InvalidRequest(format!(
                "Unsupported protocol version {} (expected {})",
                frame.v, PROTOCOL_VERSION
            )),
        );
    }

    let op = frame.request.op_name();
    match dispatch(state, session, frame.request).await {
        Ok(data) => ServerFrame::ok(frame.id, data),
        Err(error) => {
            if matches!(error, Error::DatabaseError(_) | Error::Internal(_)) {
                tracing::error!(conn = session.conn_id(), op, code = error.code(), %error, "Request failed");
            } else {
                tracing::info!(conn = session.conn_id(), op, code = error.code(), %error, "Request rejected");
            }
            ServerFrame::err(frame.id, &error)
        }
    }
}

/// Best-effort correlation id from a frame that failed to parse.
fn salvage_id(text: &str) -> u64 {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_u64))
        .unwrap_or(0)
}

/// Run synchronous storage work on the blocking pool.
async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| Error::Internal(format!("Storage task failed: {}", e)))?
}

fn to_data<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Route one request.
async fn dispatch(state: &AppState, session: &mut Session, request: Request) -> Result<Value> {
    request.validate()?;
    if request.requires_auth() {
        session.user_id()?;
    }

    match request {
        Request::Ping => to_data(&"pong"),

        Request::Login {
            username,
            password,
            bootstrap,
        } => {
            session.begin_login()?;
            let result =
                run_blocking(state, move |db| auth::login(db, &username, &password, bootstrap.as_ref()))
                    .await;

            match result {
                Ok(LoginOutcome::Authenticated(info)) => {
                    session.authenticate(info.id);
                    session.join(&state.hub, Scope::User(info.id));
                    tracing::info!(conn = session.conn_id(), user_id = info.id, "Authenticated");
                    to_data(&info)
                }
                Ok(LoginOutcome::NeedsBootstrap(info)) => {
                    session.reset();
                    to_data(&info)
                }
                Err(e) => {
                    session.reset();
                    Err(e)
                }
            }
        }

        Request::OpenChat { user_id: other } => {
            let me = session.user_id()?;
            let chat =
                run_blocking(state, move |db| directory::open_private_chat(db, me, other)).await?;
            match &chat {
                Some(chat) => session.join(&state.hub, Scope::Chat(chat.id)),
                None => session.join(&state.hub, Scope::pending_pair(me, other)),
            }
            to_data(&chat)
        }

        Request::CloseChat { id, user_id: other } => {
            let me = session.user_id()?;
            if let Some(chat_id) = id {
                session.leave(&state.hub, Scope::Chat(chat_id));
            }
            if let Some(other) = other {
                session.leave(&state.hub, Scope::pending_pair(me, other));
            }
            Ok(Value::Null)
        }

        Request::CreatePrivateChat { user_id: other } => {
            let me = session.user_id()?;
            let result =
                run_blocking(state, move |db| directory::find_or_create_private_chat(db, me, other))
                    .await?;

            let pair = Scope::pending_pair(me, other);
            if result.created {
                state.hub.publish(
                    pair,
                    &Event::ChatCreated {
                        chat_id: result.chat.id,
                        members: vec![me, other],
                    },
                    Some(session.conn_id()),
                );
            }
            session.leave(&state.hub, pair);
            session.join(&state.hub, Scope::Chat(result.chat.id));
            to_data(&result.chat)
        }

        Request::GetChatKey { chat_id, version } => {
            let me = session.user_id()?;
            let wrapped =
                run_blocking(state, move |db| keys::get_chat_key(db, chat_id, me, version)).await?;
            to_data(&wrapped)
        }

        Request::GetChatMessages {
            chat_id,
            before_id,
            limit,
        } => {
            let me = session.user_id()?;
            let cap = state.config.history_limit;
            let limit = limit.unwrap_or(cap).min(cap);
            let messages =
                run_blocking(state, move |db| ledger::list(db, chat_id, me, limit, before_id)).await?;
            to_data(&messages)
        }

        Request::SendMessage {
            chat_id,
            version,
            ciphertext,
            iv,
        } => {
            let me = session.user_id()?;
            let (message, members) = run_blocking(state, move |db| {
                let message = ledger::append(db, chat_id, me, &ciphertext, &iv, version)?;
                let members = directory::joined_member_ids(&db.connect()?, chat_id)?;
                Ok((message, members))
            })
            .await?;

            let conn = Some(session.conn_id());
            state.hub.publish(
                Scope::Chat(chat_id),
                &Event::ChatMessage {
                    chat_id,
                    message: message.clone(),
                },
                conn,
            );
            let activity = Event::Activity {
                update: ActivityUpdate::Message {
                    message: message.clone(),
                },
            };
            for member in members {
                state.hub.publish(Scope::User(member), &activity, conn);
            }
            to_data(&message)
        }

        Request::GetHome => {
            let me = session.user_id()?;
            let limit = state.config.home_limit;
            let chats = run_blocking(state, move |db| directory::home(db, me, limit)).await?;
            to_data(&chats)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServerConfig;
    use crate::test_support::{add_keyed_user, temp_db};
    use cloak_core::crypto::encoding;
    use cloak_core::protocol::{ChatResource, MessageResource};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn state() -> (tempfile::TempDir, AppState) {
        let (dir, db) = temp_db();
        (dir, AppState::new(db, ServerConfig::default()))
    }

    fn session(state: &AppState) -> (Session, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(state.hub.next_connection_id(), tx), rx)
    }

    fn logged_in(state: &AppState, user_id: i64) -> (Session, UnboundedReceiver<ServerFrame>) {
        let (mut s, rx) = session(state);
        s.authenticate(user_id);
        s.join(&state.hub, Scope::User(user_id));
        (s, rx)
    }

    fn next_event(rx: &mut UnboundedReceiver<ServerFrame>) -> Option<Event> {
        match rx.try_recv() {
            Ok(ServerFrame::Event { event }) => Some(event),
            _ => None,
        }
    }

    fn send(chat_id: i64, version: i64) -> Request {
        Request::SendMessage {
            chat_id,
            version,
            ciphertext: encoding::encode(&[9; 24]),
            iv: vec![1; 12],
        }
    }

    #[test]
    fn test_salvage_id() {
        assert_eq!(salvage_id(r#"{"v":1,"id":42,"request":{"op":"nope"}}"#), 42);
        assert_eq!(salvage_id("not json"), 0);
    }

    #[tokio::test]
    async fn test_unparseable_frame_gets_error_response() {
        let (_dir, state) = state();
        let (mut s, _rx) = session(&state);
        match handle_text(&state, &mut s, r#"{"v":1,"id":3,"request":{"op":"bogus"}}"#).await {
            ServerFrame::Response { id, ok, error, .. } => {
                assert_eq!(id, 3);
                assert!(!ok);
                assert_eq!(error.unwrap().code, 203);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_protocol_version_rejected() {
        let (_dir, state) = state();
        let (mut s, _rx) = session(&state);
        let frame = r#"{"v":99,"id":5,"request":{"op":"ping"}}"#;
        match handle_text(&state, &mut s, frame).await {
            ServerFrame::Response { id, ok, .. } => assert_eq!((id, ok), (5, false)),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_without_login() {
        let (_dir, state) = state();
        let (mut s, _rx) = session(&state);
        assert_eq!(dispatch(&state, &mut s, Request::Ping).await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_successful_frame_gets_ok_response() {
        let (_dir, state) = state();
        let (mut s, _rx) = session(&state);
        let text = serde_json::to_string(&ClientFrame::new(9, Request::Ping)).unwrap();
        match handle_text(&state, &mut s, &text).await {
            ServerFrame::Response { id, ok, data, error } => {
                assert_eq!((id, ok), (9, true));
                assert_eq!(data, Some(Value::from("pong")));
                assert!(error.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_require_authentication() {
        let (_dir, state) = state();
        let (mut s, _rx) = session(&state);
        let err = dispatch(&state, &mut s, Request::GetHome).await.unwrap_err();
        assert_eq!(err, Error::NotAuthenticated);
    }

    #[tokio::test]
    async fn test_failed_login_resets_state() {
        let (_dir, state) = state();
        let (mut s, _rx) = session(&state);
        let err = dispatch(
            &state,
            &mut s,
            Request::Login {
                username: "ghost".into(),
                password: "pw".into(),
                bootstrap: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, Error::BadCredential);
        assert_eq!(s.state(), crate::session::AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_login_joins_user_scope() {
        let (_dir, state) = state();
        let hash = auth::hash_password("pw").unwrap();
        let id = state.db.create_user("Alice", "alice", &hash).unwrap();
        let conn = state.db.connect().unwrap();
        conn.execute(
            "UPDATE users SET public_key = 'pk', encrypted_private_key = 'sk' WHERE id = ?",
            rusqlite::params![id],
        )
        .unwrap();

        let (mut s, _rx) = session(&state);
        let login = Request::Login {
            username: "alice".into(),
            password: "pw".into(),
            bootstrap: None,
        };
        dispatch(&state, &mut s, login.clone()).await.unwrap();
        assert_eq!(s.user_id().unwrap(), id);
        assert_eq!(state.hub.subscriber_count(&Scope::User(id)), 1);

        let again = dispatch(&state, &mut s, login).await.unwrap_err();
        assert_eq!(again, Error::AlreadyAuthenticated);
    }

    #[tokio::test]
    async fn test_open_chat_subscribes_pending_pair_then_chat_created() {
        let (_dir, state) = state();
        let alice = add_keyed_user(&state.db, "alice", 0);
        let bob = add_keyed_user(&state.db, "bob", 1);
        let (mut a, _ra) = logged_in(&state, alice);
        let (mut b, mut rb) = logged_in(&state, bob);

        let opened = dispatch(&state, &mut b, Request::OpenChat { user_id: alice }).await.unwrap();
        assert!(opened.is_null());
        assert!(b.is_in(&Scope::pending_pair(alice, bob)));

        let chat: ChatResource = serde_json::from_value(
            dispatch(&state, &mut a, Request::CreatePrivateChat { user_id: bob })
                .await
                .unwrap(),
        )
        .unwrap();

        assert_eq!(
            next_event(&mut rb),
            Some(Event::ChatCreated {
                chat_id: chat.id,
                members: vec![alice, bob],
            })
        );
        assert!(a.is_in(&Scope::Chat(chat.id)));
        assert!(!a.is_in(&Scope::pending_pair(alice, bob)));
    }

    #[tokio::test]
    async fn test_send_message_fans_out() {
        let (_dir, state) = state();
        let alice = add_keyed_user(&state.db, "alice", 0);
        let bob = add_keyed_user(&state.db, "bob", 1);
        let (mut a, mut ra) = logged_in(&state, alice);
        let (mut b, mut rb) = logged_in(&state, bob);

        let chat: ChatResource = serde_json::from_value(
            dispatch(&state, &mut a, Request::CreatePrivateChat { user_id: bob })
                .await
                .unwrap(),
        )
        .unwrap();
        dispatch(&state, &mut b, Request::OpenChat { user_id: alice }).await.unwrap();

        let stored: MessageResource =
            serde_json::from_value(dispatch(&state, &mut a, send(chat.id, 1)).await.unwrap()).unwrap();

        // Bob: one chat_message from the chat scope, one activity from his user scope.
        assert_eq!(
            next_event(&mut rb),
            Some(Event::ChatMessage {
                chat_id: chat.id,
                message: stored.clone(),
            })
        );
        assert_eq!(
            next_event(&mut rb),
            Some(Event::Activity {
                update: ActivityUpdate::Message { message: stored },
            })
        );
        // Alice's own connection gets nothing back.
        assert!(next_event(&mut ra).is_none());
    }

    #[tokio::test]
    async fn test_history_limit_is_capped() {
        let (_dir, db) = temp_db();
        let state = AppState::new(
            db,
            ServerConfig {
                history_limit: 3,
                ..ServerConfig::default()
            },
        );
        let alice = add_keyed_user(&state.db, "alice", 0);
        let bob = add_keyed_user(&state.db, "bob", 1);
        let (mut a, _ra) = logged_in(&state, alice);

        let chat: ChatResource = serde_json::from_value(
            dispatch(&state, &mut a, Request::CreatePrivateChat { user_id: bob })
                .await
                .unwrap(),
        )
        .unwrap();
        for _ in 0..5 {
            dispatch(&state, &mut a, send(chat.id, 1)).await.unwrap();
        }

        let page = dispatch(
            &state,
            &mut a,
            Request::GetChatMessages {
                chat_id: chat.id,
                before_id: None,
                limit: Some(100),
            },
        )
        .await
        .unwrap();
        assert_eq!(page.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_close_chat_leaves_scopes() {
        let (_dir, state) = state();
        let alice = add_keyed_user(&state.db, "alice", 0);
        let bob = add_keyed_user(&state.db, "bob", 1);
        let (mut a, _ra) = logged_in(&state, alice);

        dispatch(&state, &mut a, Request::OpenChat { user_id: bob }).await.unwrap();
        dispatch(
            &state,
            &mut a,
            Request::CloseChat {
                id: None,
                user_id: Some(bob),
            },
        )
        .await
        .unwrap();
        assert!(!a.is_in(&Scope::pending_pair(alice, bob)));
        assert_eq!(state.hub.subscriber_count(&Scope::pending_pair(alice, bob)), 0);
    }
}
