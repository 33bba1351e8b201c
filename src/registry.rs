//! Connection registry
//!
//! Bidirectional map between a logged-in identity and the connection it
//! arrived on. This is the only place that answers "who is online", and it
//! enforces one live connection per name.

use std::collections::HashMap;

use crate::types::ConnId;

/// Outcome of a failed `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyTaken;

/// Identity ⇄ connection registry
///
/// Not synchronized: it is owned by the single service loop.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `conn`
    ///
    /// Fails if the name belongs to a different connection; the existing
    /// session is never replaced. Binding the same pair twice is a no-op.
    pub fn register(&mut self, identity: &str, conn: ConnId) -> Result<(), AlreadyTaken> {
        match self.by_name.get(identity) {
            Some(existing) if *existing == conn => Ok(()),
            Some(_) => Err(AlreadyTaken),
            None => {
                self.by_name.insert(identity.to_string(), conn);
                self.by_conn.insert(conn, identity.to_string());
                Ok(())
            }
        }
    }

    /// Remove `identity`, returning the connection it was bound to
    pub fn unregister(&mut self, identity: &str) -> Option<ConnId> {
        let conn = self.by_name.remove(identity)?;
        self.by_conn.remove(&conn);
        Some(conn)
    }

    /// Remove whatever identity `conn` was bound to
    pub fn unregister_connection(&mut self, conn: ConnId) -> Option<String> {
        let identity = self.by_conn.remove(&conn)?;
        self.by_name.remove(&identity);
        Some(identity)
    }

    pub fn lookup(&self, identity: &str) -> Option<ConnId> {
        self.by_name.get(identity).copied()
    }

    pub fn identity_of(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.by_name.contains_key(identity)
    }

    /// Number of logged-in identities
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        let conn = ConnId::new();

        assert!(registry.register("Alice", conn).is_ok());
        assert_eq!(registry.lookup("Alice"), Some(conn));
        assert_eq!(registry.identity_of(conn), Some("Alice"));
        assert!(registry.is_connected("Alice"));
        assert!(!registry.is_connected("alice"));
    }

    #[test]
    fn test_duplicate_name_rejected_without_mutation() {
        let mut registry = Registry::new();
        let first = ConnId::new();
        let second = ConnId::new();

        registry.register("Alice", first).unwrap();
        assert_eq!(registry.register("Alice", second), Err(AlreadyTaken));

        assert_eq!(registry.lookup("Alice"), Some(first));
        assert_eq!(registry.identity_of(second), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_pair_is_noop() {
        let mut registry = Registry::new();
        let conn = ConnId::new();

        registry.register("Alice", conn).unwrap();
        assert!(registry.register("Alice", conn).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_both_directions() {
        let mut registry = Registry::new();
        let a = ConnId::new();
        let b = ConnId::new();
        registry.register("Alice", a).unwrap();
        registry.register("Bob", b).unwrap();

        assert_eq!(registry.unregister("Alice"), Some(a));
        assert_eq!(registry.identity_of(a), None);
        assert_eq!(registry.unregister("Alice"), None);

        assert_eq!(registry.unregister_connection(b), Some("Bob".to_string()));
        assert_eq!(registry.lookup("Bob"), None);
        assert!(registry.is_empty());
    }
}
