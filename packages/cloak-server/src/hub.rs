//! Connection registry and event fan-out.
//!
//! Every WebSocket gets a [`ConnectionId`] and an outbound channel. The hub
//! maps each [`Scope`] to the connections subscribed to it; publishing an
//! event pushes a copy down every channel in the scope. Delivery is
//! best-effort: a closed channel is skipped and cleaned up when its
//! connection releases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use cloak_core::protocol::{Event, ServerFrame};

use crate::rooms::Scope;

pub type ConnectionId = u64;

/// A connected client's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<ServerFrame>;

#[derive(Clone, Default)]
pub struct Hub {
    scopes: Arc<DashMap<Scope, HashMap<ConnectionId, ClientSender>>>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a connection to a scope. Re-subscribing is a no-op.
    pub fn subscribe(&self, scope: Scope, conn: ConnectionId, sender: ClientSender) {
        self.scopes.entry(scope).or_default().insert(conn, sender);
        tracing::debug!(scope = %scope, conn, "Subscribed");
    }

    pub fn unsubscribe(&self, scope: Scope, conn: ConnectionId) {
        if let Some(mut members) = self.scopes.get_mut(&scope) {
            members.remove(&conn);
        }
        self.scopes.remove_if(&scope, |_, members| members.is_empty());
        tracing::debug!(scope = %scope, conn, "Unsubscribed");
    }

    /// Remove a connection from every scope it joined.
    pub fn release<'a>(&self, conn: ConnectionId, scopes: impl IntoIterator<Item = &'a Scope>) {
        for scope in scopes {
            self.unsubscribe(*scope, conn);
        }
    }

    /// Push `event` to every connection in `scope` except `except`.
    /// Returns how many channels accepted it.
    pub fn publish(&self, scope: Scope, event: &Event, except: Option<ConnectionId>) -> usize {
        let Some(members) = self.scopes.get(&scope) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn, sender) in members.iter() {
            if Some(*conn) == except {
                continue;
            }
            let frame = ServerFrame::Event { event: event.clone() };
            if sender.send(frame).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(scope = %scope, delivered, "Published event");
        delivered
    }

    /// Number of connections subscribed to `scope`.
    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.scopes.get(scope).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of scopes with at least one subscriber.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}
