//! Basic type definitions for the chat relay
//!
//! Provides newtype wrappers for type safety:
//! - `ConnId`: UUID-based handle for one accepted connection
//! - `ListenPort`: TCP port validated at construction

use uuid::Uuid;

use crate::error::ConfigError;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4. The registry and router refer to connections only
/// through this handle; the socket itself stays with the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub Uuid);

impl ConnId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listening port outside the privileged range
///
/// Construction fails for anything below 1024, so a relay can never be
/// configured onto a system port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenPort(u16);

impl ListenPort {
    /// Lowest accepted port number
    pub const MIN: u16 = 1024;

    /// Validate a raw port number
    pub fn new(port: u16) -> Result<Self, ConfigError> {
        if port < Self::MIN {
            return Err(ConfigError::PortOutOfRange(port));
        }
        Ok(Self(port))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ListenPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
