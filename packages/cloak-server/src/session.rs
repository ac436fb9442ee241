//! Per-connection session state.
//!
//! ```text
//!                 login                 password ok + keys
//! Unauthenticated ─────▶ Authenticating ───────────────────▶ Authenticated
//!        ▲                     │
//!        └─────────────────────┘  bad credential / needs bootstrap
//! ```
//!
//! A session also remembers which scopes its connection joined so they can
//! all be released when the socket closes.

use std::collections::HashSet;

use cloak_core::protocol::UserId;
use cloak_core::{Error, Result};

use crate::hub::{ClientSender, ConnectionId, Hub};
use crate::rooms::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated { user_id: UserId },
}

pub struct Session {
    conn_id: ConnectionId,
    sender: ClientSender,
    state: AuthState,
    scopes: HashSet<Scope>,
}

impl Session {
    pub fn new(conn_id: ConnectionId, sender: ClientSender) -> Self {
        Self {
            conn_id,
            sender,
            state: AuthState::Unauthenticated,
            scopes: HashSet::new(),
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Enter `Authenticating`. A connection authenticates at most once.
    pub fn begin_login(&mut self) -> Result<()> {
        match self.state {
            AuthState::Authenticated { .. } => Err(Error::AlreadyAuthenticated),
            _ => {
                self.state = AuthState::Authenticating;
                Ok(())
            }
        }
    }

    pub fn authenticate(&mut self, user_id: UserId) {
        self.state = AuthState::Authenticated { user_id };
    }

    /// Back to `Unauthenticated` after a failed or incomplete login.
    pub fn reset(&mut self) {
        self.state = AuthState::Unauthenticated;
    }

    /// The authenticated user, or `NotAuthenticated`.
    pub fn user_id(&self) -> Result<UserId> {
        match self.state {
            AuthState::Authenticated { user_id } => Ok(user_id),
            _ => Err(Error::NotAuthenticated),
        }
    }

    pub fn join(&mut self, hub: &Hub, scope: Scope) {
        hub.subscribe(scope, self.conn_id, self.sender.clone());
        self.scopes.insert(scope);
    }

    pub fn leave(&mut self, hub: &Hub, scope: Scope) {
        if self.scopes.remove(&scope) {
            hub.unsubscribe(scope, self.conn_id);
        }
    }

    pub fn is_in(&self, scope: &Scope) -> bool {
        self.scopes.contains(scope)
    }

    /// Leave every scope. Called once when the socket closes.
    pub fn release(&mut self, hub: &Hub) {
        hub.release(self.conn_id, self.scopes.iter());
        self.scopes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(hub: &Hub) -> (Session, mpsc::UnboundedReceiver<cloak_core::protocol::ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(hub.next_connection_id(), tx), rx)
    }

    #[test]
    fn test_login_state_machine() {
        let hub = Hub::new();
        let (mut s, _rx) = session(&hub);
        assert_eq!(s.state(), AuthState::Unauthenticated);
        assert_eq!(s.user_id().unwrap_err(), Error::NotAuthenticated);

        s.begin_login().unwrap();
        assert_eq!(s.state(), AuthState::Authenticating);
        s.reset();
        assert_eq!(s.state(), AuthState::Unauthenticated);

        s.begin_login().unwrap();
        s.authenticate(7);
        assert_eq!(s.user_id().unwrap(), 7);
        assert_eq!(s.begin_login().unwrap_err(), Error::AlreadyAuthenticated);
        assert_eq!(s.user_id().unwrap(), 7);
    }

    #[test]
    fn test_join_leave_and_release() {
        let hub = Hub::new();
        let (mut s, _rx) = session(&hub);

        s.join(&hub, Scope::User(1));
        s.join(&hub, Scope::Chat(2));
        s.join(&hub, Scope::pending_pair(1, 3));
        assert!(s.is_in(&Scope::Chat(2)));
        assert_eq!(hub.scope_count(), 3);

        s.leave(&hub, Scope::Chat(2));
        assert!(!s.is_in(&Scope::Chat(2)));
        assert_eq!(hub.subscriber_count(&Scope::Chat(2)), 0);

        s.release(&hub);
        assert_eq!(hub.scope_count(), 0);
    }

    #[test]
    fn test_leave_unjoined_scope_keeps_others_subscribed() {
        let hub = Hub::new();
        let (mut a, _ra) = session(&hub);
        let (mut b, _rb) = session(&hub);
        a.join(&hub, Scope::Chat(1));

        b.leave(&hub, Scope::Chat(1));
        assert_eq!(hub.subscriber_count(&Scope::Chat(1)), 1);
    }
}
