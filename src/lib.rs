//! Multi-client Chat Relay Library
//!
//! A TCP chat relay: clients log in under a unique name, exchange direct
//! messages and keep a contact list, while a storage collaborator records
//! login history and message counters.
//!
//! # Features
//! - Newline-delimited JSON protocol
//! - One live connection per username
//! - Direct messages with per-recipient FIFO delivery
//! - Contact list management
//! - Login history, active sessions and message counters in SQLite
//! - Topology change notifications for monitors
//!
//! # Architecture
//! A single accept-and-service loop owns all state:
//! - `Multiplexer` polls every connection with one bounded wait
//! - `Relay` validates requests and updates the `Registry` and `Router`
//! - `Router` hands queued messages to writable recipients
//! - No locks needed in the core - only one task ever touches it
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use chat_relay::{Config, MemoryStorage, RelayService, ServiceSettings, Topology};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let (topology, _changes) = Topology::new();
//!     let service = RelayService::bind(
//!         config.bind_addr().unwrap(),
//!         ServiceSettings::from(&config),
//!         Arc::new(MemoryStorage::new()),
//!         topology,
//!     )
//!     .await
//!     .unwrap();
//!     service.run().await;
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod monitor;
pub mod multiplexer;
pub mod registry;
pub mod router;
pub mod server;
pub mod service;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use config::Config;
pub use connection::Connection;
pub use error::{CodecError, ConfigError, RelayError, StorageError, TransportError};
pub use message::{Account, ChatMessage, ClientMessage, Response, ServerMessage};
pub use monitor::Topology;
pub use multiplexer::{Multiplexer, Readiness};
pub use registry::Registry;
pub use router::Router;
pub use server::{Outcome, Relay, SessionState};
pub use service::{RelayService, ServiceSettings};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use types::{ConnId, ListenPort};
