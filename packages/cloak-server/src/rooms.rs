//! Fan-out scopes.
//!
//! A scope names a set of connections that receive the same events:
//!
//! | Scope                 | Joined by                         | Receives        |
//! |-----------------------|-----------------------------------|-----------------|
//! | `Chat(id)`            | `open_chat`, `create_private_chat`| `chat_message`  |
//! | `User(id)`            | successful `login`                | `activity`      |
//! | `PendingPair(a, b)`   | `open_chat` with no chat yet      | `chat_created`  |

use std::fmt;

use cloak_core::protocol::{ChatId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Chat(ChatId),
    User(UserId),
    /// Two users waiting for a private chat. Always stored low id first;
    /// build it with [`Scope::pending_pair`].
    PendingPair(UserId, UserId),
}

impl Scope {
    /// The pending-pair scope for two users, in either order.
    pub fn pending_pair(a: UserId, b: UserId) -> Self {
        if a <= b {
            Scope::PendingPair(a, b)
        } else {
            Scope::PendingPair(b, a)
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Chat(id) => write!(f, "chat:{}", id),
            Scope::User(id) => write!(f, "user:{}", id),
            Scope::PendingPair(a, b) => write!(f, "pending:{}:{}", a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_pair_is_order_independent() {
        assert_eq!(Scope::pending_pair(7, 3), Scope::pending_pair(3, 7));
        assert_eq!(Scope::pending_pair(7, 3), Scope::PendingPair(3, 7));
    }

    #[test]
    fn test_scopes_are_distinct() {
        assert_ne!(Scope::Chat(1), Scope::User(1));
        assert_ne!(Scope::pending_pair(1, 2), Scope::pending_pair(1, 3));
    }

    #[test]
    fn test_display() {
        assert_eq!(Scope::Chat(4).to_string(), "chat:4");
        assert_eq!(Scope::User(9).to_string(), "user:9");
        assert_eq!(Scope::pending_pair(5, 2).to_string(), "pending:2:5");
    }
}
