//! # Storage Module
//!
//! SQLite persistence for users, chats, memberships, wrapped chat keys and
//! ciphertext messages.

pub mod database;
pub mod schema;

pub use database::{Database, UserRecord};
