//! Error types for the chat relay
//!
//! Protocol errors are answered on the wire and leave the connection open;
//! transport errors tear the connection down. Startup errors (config, bind,
//! opening the database) are the only ones allowed to reach `main`.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Protocol-level errors
///
/// Each one becomes an error `Response` for the requesting client.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Request is missing its action or a required field
    #[error("Bad request")]
    BadRequest,

    /// Another live connection already owns this name
    #[error("Name taken: {0}")]
    NameTaken(String),

    /// Connection tried to log in a second time
    #[error("Already authenticated")]
    AlreadyAuthenticated,

    /// Request claims an identity not bound to the sending connection
    #[error("Identity not owned by this connection: {0}")]
    NotOwner(String),

    /// MESSAGE to a name that is not online
    #[error("Recipient unknown: {0}")]
    RecipientUnknown(String),

    /// Recipient went away after the message was accepted
    #[error("Recipient disconnected: {0}")]
    RecipientGone(String),

    /// Recipient has too many undelivered messages
    #[error("Backlog full for {0}")]
    BacklogFull(String),

    /// Storage failed while building a reply
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Per-connection transport errors (fatal for that connection only)
#[derive(Debug, Error)]
pub enum TransportError {
    /// IO error on the socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the stream
    #[error("Connection closed by peer")]
    Closed,

    /// Inbound bytes could not be framed or decoded
    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    /// Peer stopped reading and its unsent output hit the limit
    #[error("Outbound buffer full: {0} bytes pending")]
    OutboundFull(usize),
}

/// Framing and JSON decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame exceeded the configured limit
    #[error("Frame too long: {0} bytes")]
    FrameTooLong(usize),

    /// Frame decoded to something other than a JSON object
    #[error("Frame is not a JSON object")]
    NotAnObject,
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Name has never logged in
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Another holder of the table lock panicked
    #[error("Storage lock poisoned")]
    Poisoned,

    /// Database directory could not be created or the writer thread spawned
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite query or schema error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Database writer thread is no longer running
    #[error("Storage writer stopped")]
    WriterStopped,
}

/// Configuration errors (fatal at startup)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid TOML
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Port below the unprivileged range
    #[error("Port {0} out of range (1024-65535)")]
    PortOutOfRange(u16),

    /// Host is not an IP address
    #[error("Invalid listen host: {0}")]
    InvalidAddress(String),
}
