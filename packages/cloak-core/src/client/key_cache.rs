//! Chat key cache with request coalescing.
//!
//! Concurrent lookups of the same `(chat, version)` share one in-flight
//! fetch-and-unwrap; every caller gets the same result. Successful keys are
//! kept for the life of the cache. Failures are handed to all current
//! waiters and then forgotten, so the next lookup tries again.

use std::collections::HashMap;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::crypto::ChatKey;
use crate::error::Result;
use crate::protocol::{ChatId, KeyVersion};

type KeyId = (ChatId, KeyVersion);
type PendingKey = Shared<BoxFuture<'static, Result<ChatKey>>>;

#[derive(Default)]
pub struct ChatKeyCache {
    ready: Mutex<HashMap<KeyId, ChatKey>>,
    inflight: Mutex<HashMap<KeyId, PendingKey>>,
}

impl ChatKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached key, if already resolved.
    pub fn get(&self, chat_id: ChatId, version: KeyVersion) -> Option<ChatKey> {
        self.ready.lock().get(&(chat_id, version)).cloned()
    }

    /// Store a key obtained out of band, e.g. with a chat resource.
    pub fn insert(&self, chat_id: ChatId, version: KeyVersion, key: ChatKey) {
        self.ready.lock().insert((chat_id, version), key);
    }

    /// Resolve a key, calling `fetch` only if no other caller is already
    /// resolving it.
    pub async fn get_or_fetch<F, Fut>(&self, chat_id: ChatId, version: KeyVersion, fetch: F) -> Result<ChatKey>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ChatKey>> + Send + 'static,
    {
        let id = (chat_id, version);
        if let Some(key) = self.get(chat_id, version) {
            return Ok(key);
        }

        let pending = {
            let mut inflight = self.inflight.lock();
            // Re-check under the in-flight lock: a fetch may have finished in between.
            if let Some(key) = self.ready.lock().get(&id) {
                return Ok(key.clone());
            }
            inflight
                .entry(id)
                .or_insert_with(|| {
                    tracing::debug!(chat_id, version, "Fetching chat key");
                    fetch().boxed().shared()
                })
                .clone()
        };

        let result = pending.clone().await;

        let mut inflight = self.inflight.lock();
        if inflight.get(&id).is_some_and(|current| current.ptr_eq(&pending)) {
            inflight.remove(&id);
            if let Ok(key) = &result {
                self.ready.lock().insert(id, key.clone());
            }
        }
        result
    }

    /// Drop every cached key, e.g. when a different account logs in.
    pub fn clear(&self) {
        self.ready.lock().clear();
        self.inflight.lock().clear();
    }
}
