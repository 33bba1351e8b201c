//! Relay configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_HOST, RELAY_PORT)
//! - TOML configuration file
//! - Built-in defaults

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::ListenPort;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "chat_relay.toml";

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long one accept attempt may wait, in milliseconds.
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_ms: u64,

    /// Upper bound on one readiness wait, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Maximum unsent bytes held for one client before it is dropped.
    #[serde(default = "default_max_outbound_bytes")]
    pub max_outbound_bytes: usize,

    /// Maximum undelivered messages per recipient.
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,

    /// SQLite database file; in-memory only when unset.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    /// Log the active-session table on every login/logout.
    #[serde(default = "default_true")]
    pub monitor: bool,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7777)
}

fn default_accept_timeout() -> u64 {
    50
}

fn default_poll_interval() -> u64 {
    250
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_outbound_bytes() -> usize {
    1024 * 1024 // 1 MB
}

fn default_max_backlog() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            accept_timeout_ms: default_accept_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_frame_bytes: default_max_frame_bytes(),
            max_outbound_bytes: default_max_outbound_bytes(),
            max_backlog: default_max_backlog(),
            storage_path: None,
            monitor: true,
        }
    }
}

impl Config {
    /// Load `chat_relay.toml` from the working directory, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            return Self::from_file(DEFAULT_CONFIG_FILE);
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Validated listening port.
    pub fn listen_port(&self) -> Result<ListenPort, ConfigError> {
        ListenPort::new(self.port)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is privileged or the host is not an IP
    /// address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let port = self.listen_port()?;
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.host.clone()))?;
        Ok(SocketAddr::new(ip, port.get()))
    }
}
