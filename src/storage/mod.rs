//! Persistence collaborator
//!
//! The relay only talks to storage through the `Storage` trait. Mutating
//! calls are fire-and-forget from the relay's point of view: failures are
//! logged, never answered.
//!
//! - `MemoryStorage` keeps everything in process memory
//! - `SqliteStorage` keeps users, sessions, history and contacts in SQLite

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StorageError;

/// Known user and when they last logged in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub name: String,
    pub last_login: DateTime<Utc>,
}

/// Currently logged-in session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSession {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub login_time: DateTime<Utc>,
}

/// One entry of the login history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginRecord {
    pub name: String,
    pub time: DateTime<Utc>,
    pub ip: IpAddr,
    pub port: u16,
}

/// Per-user message counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageStats {
    pub name: String,
    pub last_login: DateTime<Utc>,
    pub sent: u64,
    pub received: u64,
}

/// Storage contract consumed by the relay
///
/// An implementation may apply mutations after the call returns, but a read
/// must observe every mutation issued before it. Listings are sorted by name
/// (history by insertion order).
pub trait Storage: Send + Sync {
    /// Create or refresh the user and open an active session
    fn record_login(&self, identity: &str, ip: IpAddr, port: u16) -> Result<(), StorageError>;

    /// Close the user's active session
    fn record_logout(&self, identity: &str) -> Result<(), StorageError>;

    /// Bump the sender's sent counter and the destination's received counter
    fn record_message(&self, sender: &str, destination: &str) -> Result<(), StorageError>;

    /// Add a contact edge; unknown contact, self edge and duplicates are no-ops
    fn add_contact(&self, identity: &str, contact: &str) -> Result<(), StorageError>;

    /// Remove a contact edge; a missing edge is a no-op
    fn remove_contact(&self, identity: &str, contact: &str) -> Result<(), StorageError>;

    fn list_users(&self) -> Result<Vec<UserRecord>, StorageError>;

    fn list_active(&self) -> Result<Vec<ActiveSession>, StorageError>;

    fn list_contacts(&self, identity: &str) -> Result<Vec<String>, StorageError>;

    /// Login history, optionally for one user only
    fn login_history(&self, identity: Option<&str>) -> Result<Vec<LoginRecord>, StorageError>;

    fn message_stats(&self) -> Result<Vec<MessageStats>, StorageError>;
}
