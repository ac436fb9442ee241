//! # Chat Client
//!
//! High-level client used by a UI layer. Wraps a [`Connection`], the
//! [`CryptoEngine`] unlocked at login, the coalescing [`ChatKeyCache`] and
//! the [`RetryQueue`] for calls issued while the socket is down.
//!
//! ## Typical Session
//!
//! ```text
//! connect ─► login ─┬─ Ready ──────────────► open_chat / create_private_chat
//!                   └─ NeedsBootstrap ─► bootstrap ─┘            │
//!                                                                ▼
//!                                     send_text ◄─► history / decrypt events
//! ```

pub mod connection;
pub mod engine;
pub mod key_cache;
pub mod queue;

pub use connection::{Connection, DEFAULT_CALL_TIMEOUT};
pub use engine::{CryptoEngine, DecryptedMessage, EncryptedBody};
pub use key_cache::ChatKeyCache;
pub use queue::{QueuedWork, RetryQueue};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::crypto::ChatKey;
use crate::error::{Error, Result};
use crate::identity;
use crate::protocol::{
    AuthInfo, Bootstrap, ChatId, ChatResource, Event, HomeChatResource, KeyVersion,
    MessageId, MessageResource, Request, UserId,
};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the server's `/ws` route
    pub url: String,
    /// Per-call timeout
    pub call_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// On `Disconnected`, park the call in the retry queue instead of failing.
    /// Also waits behind any replay in progress.
    pub queue: bool,
}

/// Result of [`ChatClient::login`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Private key unlocked; the connection is authenticated.
    Ready(AuthInfo),
    /// The account has no key pair yet. Call [`ChatClient::bootstrap`].
    NeedsBootstrap(AuthInfo),
}

struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

pub struct ChatClient {
    config: ClientConfig,
    connection: RwLock<Arc<Connection>>,
    events_tx: mpsc::UnboundedSender<Event>,
    engine: RwLock<Option<Arc<CryptoEngine>>>,
    credentials: RwLock<Option<Credentials>>,
    user: RwLock<Option<AuthInfo>>,
    keys: ChatKeyCache,
    queue: RetryQueue,
    /// Peers whose chat is open, with the chat id once it exists. Re-opened
    /// after a reconnect.
    open_chats: Mutex<HashMap<UserId, Option<ChatId>>>,
}

impl ChatClient {
    /// Connect to the server. Server-push events arrive on the returned
    /// receiver for the whole life of the client, across reconnects.
    pub async fn connect(config: ClientConfig) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Connection::connect(&config.url, config.call_timeout, events_tx.clone()).await?;
        tracing::info!(url = config.url.as_str(), "Connected");

        let client = Self {
            config,
            connection: RwLock::new(Arc::new(connection)),
            events_tx,
            engine: RwLock::new(None),
            credentials: RwLock::new(None),
            user: RwLock::new(None),
            keys: ChatKeyCache::new(),
            queue: RetryQueue::new(),
            open_chats: Mutex::new(HashMap::new()),
        };
        Ok((client, events_rx))
    }

    fn connection(&self) -> Arc<Connection> {
        self.connection.read().clone()
    }

    fn engine(&self) -> Result<Arc<CryptoEngine>> {
        self.engine.read().clone().ok_or(Error::NotAuthenticated)
    }

    /// The logged-in user.
    pub fn user(&self) -> Option<AuthInfo> {
        self.user.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_connected()
    }

    /// Number of calls waiting for a reconnect.
    pub fn queued_calls(&self) -> usize {
        self.queue.len()
    }

    async fn call(&self, request: Request, options: CallOptions) -> Result<serde_json::Value> {
        if options.queue {
            self.run_queued(QueuedWork::Request(request)).await
        } else {
            self.connection().call(request).await
        }
    }

    /// Run queueable work in order with the retry queue. Work waits behind a
    /// replay in progress and is parked if the socket it tried is down.
    async fn run_queued(&self, mut work: QueuedWork) -> Result<serde_json::Value> {
        loop {
            // Read before the gate so a connection published by a replay
            // that started after the check is never used directly.
            let connection = self.connection();
            work = match self.queue.push_if(work, || false) {
                Ok(rx) => return rx.await.map_err(|_| Error::Disconnected)?,
                Err(work) => work,
            };

            match self.perform(&connection, &work).await {
                Err(Error::Disconnected) => {
                    let stale = || Arc::ptr_eq(&self.connection(), &connection);
                    match self.queue.push_if(work, stale) {
                        Ok(rx) => return rx.await.map_err(|_| Error::Disconnected)?,
                        // A reconnect finished meanwhile; try the new socket.
                        Err(back) => work = back,
                    }
                }
                other => return other,
            }
        }
    }

    async fn perform(&self, connection: &Arc<Connection>, work: &QueuedWork) -> Result<serde_json::Value> {
        match work {
            QueuedWork::Request(request) => connection.call(request.clone()).await,
            QueuedWork::Text { chat_id, version, text } => {
                let engine = self.engine()?;
                let key = self.fetch_chat_key(connection.clone(), *chat_id, *version).await?;
                let body = engine.encrypt_text(&key, text.as_str())?;
                connection
                    .call(Request::SendMessage {
                        chat_id: *chat_id,
                        version: *version,
                        ciphertext: body.ciphertext,
                        iv: body.iv,
                    })
                    .await
            }
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, request: Request, options: CallOptions) -> Result<T> {
        let value = self.call(request, options).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::DeserializationError(format!("Unexpected response shape: {}", e)))
    }

    // ── Session ───────────────────────────────────────────────────────────

    /// Log in and unlock the private key.
    ///
    /// A wrong password is reported by the server as `BadCredential`. If the
    /// server accepted the password but the stored key blob does not unlock,
    /// the same error is returned.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        let auth: AuthInfo = self
            .call_as(
                Request::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                    bootstrap: None,
                },
                CallOptions::default(),
            )
            .await?;

        if !auth.is_bootstrapped() {
            tracing::info!(user_id = auth.id, "Account needs key bootstrap");
            return Ok(LoginOutcome::NeedsBootstrap(auth));
        }

        let engine = CryptoEngine::from_auth(password, &auth)?;
        self.set_session(username, password, engine, &auth);
        Ok(LoginOutcome::Ready(auth))
    }

    /// First login: generate a key pair protected by `new_password`, send it
    /// with the login, and adopt `new_password` as the account password.
    pub async fn bootstrap(&self, username: &str, password: &str, new_password: &str) -> Result<AuthInfo> {
        let (pair, keys) = identity::bootstrap(new_password)?;
        let auth: AuthInfo = self
            .call_as(
                Request::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                    bootstrap: Some(Bootstrap {
                        new_password: new_password.to_string(),
                        keys,
                    }),
                },
                CallOptions::default(),
            )
            .await?;

        self.set_session(username, new_password, CryptoEngine::new(pair), &auth);
        Ok(auth)
    }

    fn set_session(&self, username: &str, password: &str, engine: CryptoEngine, auth: &AuthInfo) {
        let previous = self.user.read().as_ref().map(|user| user.id);
        if previous.is_some_and(|id| id != auth.id) {
            self.keys.clear();
            self.open_chats.lock().clear();
        }
        *self.engine.write() = Some(Arc::new(engine));
        *self.credentials.write() = Some(Credentials {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        });
        *self.user.write() = Some(auth.clone());
        tracing::info!(user_id = auth.id, "Logged in");
    }

    /// Open a fresh socket, log in again with the stored credentials,
    /// re-open the chats that were open and replay queued calls in order.
    ///
    /// The new socket only becomes visible to other calls after the login
    /// succeeds, and queueable calls wait until the queue has been emptied.
    /// On failure the queued calls stay queued for the next attempt.
    pub async fn reconnect(&self) -> Result<()> {
        self.queue.begin_replay();
        let result = self.restore_session().await;
        if result.is_err() {
            self.queue.abort_replay();
        }
        result
    }

    async fn restore_session(&self) -> Result<()> {
        let connection = Arc::new(
            Connection::connect(&self.config.url, self.config.call_timeout, self.events_tx.clone()).await?,
        );

        let credentials = self
            .credentials
            .read()
            .as_ref()
            .map(|c| (c.username.clone(), c.password.clone()));
        if let Some((username, password)) = credentials {
            connection
                .call(Request::Login {
                    username,
                    password: password.to_string(),
                    bootstrap: None,
                })
                .await?;
            self.reopen_chats(&connection).await?;
        }

        *self.connection.write() = connection.clone();
        tracing::info!(url = self.config.url.as_str(), "Reconnected");
        self.replay_queue(&connection).await
    }

    async fn reopen_chats(&self, connection: &Connection) -> Result<()> {
        let peers: Vec<UserId> = self.open_chats.lock().keys().copied().collect();
        for user_id in peers {
            let value = connection.call(Request::OpenChat { user_id }).await?;
            let chat: Option<ChatResource> = serde_json::from_value(value)
                .map_err(|e| Error::DeserializationError(format!("Unexpected response shape: {}", e)))?;
            if let Some(chat) = &chat {
                self.accept_chat_key(chat)?;
            }
            self.open_chats.lock().insert(user_id, chat.map(|c| c.id));
        }
        Ok(())
    }

    async fn replay_queue(&self, connection: &Arc<Connection>) -> Result<()> {
        loop {
            let batch = self.queue.next_batch();
            if batch.is_empty() {
                return Ok(());
            }
            tracing::debug!(count = batch.len(), "Replaying queued calls");

            let mut calls = batch.into_iter();
            while let Some(call) = calls.next() {
                match self.perform(connection, &call.work).await {
                    Err(Error::Disconnected) => {
                        let mut remaining = vec![call];
                        remaining.extend(calls);
                        self.queue.requeue_front(remaining);
                        return Err(Error::Disconnected);
                    }
                    result => call.resolve(result),
                }
            }
        }
    }

    /// Drop the socket. Queued calls fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.connection().close();
        self.queue.fail_all(Error::Disconnected);
    }

    // ── Chats ─────────────────────────────────────────────────────────────

    /// Open the private chat with `user_id`, if it exists. While `None`, the
    /// connection is subscribed to chat creation for that pair.
    pub async fn open_chat(&self, user_id: UserId) -> Result<Option<ChatResource>> {
        let chat: Option<ChatResource> = self
            .call_as(Request::OpenChat { user_id }, CallOptions::default())
            .await?;
        if let Some(chat) = &chat {
            self.accept_chat_key(chat)?;
        }
        self.open_chats.lock().insert(user_id, chat.as_ref().map(|c| c.id));
        Ok(chat)
    }

    pub async fn close_chat(&self, chat_id: Option<ChatId>, user_id: Option<UserId>) -> Result<()> {
        self.call(Request::CloseChat { id: chat_id, user_id }, CallOptions::default())
            .await?;
        self.open_chats
            .lock()
            .retain(|peer, chat| user_id != Some(*peer) && (chat.is_none() || *chat != chat_id));
        Ok(())
    }

    /// Find or create the private chat with `user_id`.
    pub async fn create_private_chat(&self, user_id: UserId) -> Result<ChatResource> {
        let chat: ChatResource = self
            .call_as(Request::CreatePrivateChat { user_id }, CallOptions::default())
            .await?;
        self.accept_chat_key(&chat)?;
        self.open_chats.lock().insert(user_id, Some(chat.id));
        Ok(chat)
    }

    pub async fn home(&self) -> Result<Vec<HomeChatResource>> {
        self.call_as(Request::GetHome, CallOptions::default()).await
    }

    /// Unwrap the key delivered with a chat resource and cache it.
    pub fn accept_chat_key(&self, chat: &ChatResource) -> Result<ChatKey> {
        if let Some(key) = self.keys.get(chat.id, chat.version) {
            return Ok(key);
        }
        let key = self.engine()?.unwrap_chat_key(&chat.encrypted_chat_key)?;
        self.keys.insert(chat.id, chat.version, key.clone());
        Ok(key)
    }

    /// Resolve the chat key for `(chat_id, version)`, fetching and unwrapping
    /// it at most once however many callers ask concurrently.
    pub async fn chat_key(&self, chat_id: ChatId, version: KeyVersion) -> Result<ChatKey> {
        self.fetch_chat_key(self.connection(), chat_id, version).await
    }

    async fn fetch_chat_key(
        &self,
        connection: Arc<Connection>,
        chat_id: ChatId,
        version: KeyVersion,
    ) -> Result<ChatKey> {
        let engine = self.engine()?;
        self.keys
            .get_or_fetch(chat_id, version, move || async move {
                let value = connection.call(Request::GetChatKey { chat_id, version }).await?;
                let wrapped: String = serde_json::from_value(value)
                    .map_err(|e| Error::DeserializationError(e.to_string()))?;
                engine.unwrap_chat_key(&wrapped)
            })
            .await
    }

    // ── Messages ──────────────────────────────────────────────────────────

    /// Encrypt and send a text message under key `version`. Queued for retry
    /// if the socket drops. A key that is not cached yet is fetched when the
    /// send runs, so the message is queued even if that fetch cannot happen.
    pub async fn send_text(&self, chat_id: ChatId, version: KeyVersion, text: &str) -> Result<MessageResource> {
        let engine = self.engine()?;
        let value = match self.keys.get(chat_id, version) {
            Some(key) => {
                let body = engine.encrypt_text(&key, text)?;
                let request = Request::SendMessage {
                    chat_id,
                    version,
                    ciphertext: body.ciphertext,
                    iv: body.iv,
                };
                self.call(request, CallOptions { queue: true }).await?
            }
            None => {
                self.run_queued(QueuedWork::Text {
                    chat_id,
                    version,
                    text: Zeroizing::new(text.to_string()),
                })
                .await?
            }
        };
        serde_json::from_value(value)
            .map_err(|e| Error::DeserializationError(format!("Unexpected response shape: {}", e)))
    }

    /// Fetch history (oldest first) without decrypting.
    pub async fn messages(&self, chat_id: ChatId, before_id: Option<MessageId>) -> Result<Vec<MessageResource>> {
        self.call_as(
            Request::GetChatMessages {
                chat_id,
                before_id,
                limit: None,
            },
            CallOptions::default(),
        )
        .await
    }

    /// Decrypt one message, resolving its key version on demand.
    pub async fn decrypt(&self, message: &MessageResource) -> Result<DecryptedMessage> {
        let engine = self.engine()?;
        let key = self.chat_key(message.chat_id, message.chat_key_version).await?;
        let text = engine.decrypt_text(&key, &message.ciphertext, &message.iv)?;
        Ok(DecryptedMessage {
            message: message.clone(),
            text,
        })
    }

    /// Fetch and decrypt history, oldest first.
    pub async fn history(&self, chat_id: ChatId) -> Result<Vec<DecryptedMessage>> {
        let messages = self.messages(chat_id, None).await?;
        let mut out = Vec::with_capacity(messages.len());
        for message in &messages {
            out.push(self.decrypt(message).await?);
        }
        Ok(out)
    }
}
