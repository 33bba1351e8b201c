//! Process-local store
//!
//! Everything lives behind one mutex and is gone when the process exits.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{ActiveSession, LoginRecord, MessageStats, Storage, UserRecord};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct User {
    last_login: DateTime<Utc>,
    sent: u64,
    received: u64,
    contacts: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<String, User>,
    active: BTreeMap<String, ActiveSession>,
    history: Vec<LoginRecord>,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl Storage for MemoryStorage {
    fn record_login(&self, identity: &str, ip: IpAddr, port: u16) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        let now = Utc::now();

        tables
            .users
            .entry(identity.to_string())
            .and_modify(|user| user.last_login = now)
            .or_insert_with(|| User {
                last_login: now,
                sent: 0,
                received: 0,
                contacts: BTreeSet::new(),
            });
        tables.active.insert(
            identity.to_string(),
            ActiveSession {
                name: identity.to_string(),
                ip,
                port,
                login_time: now,
            },
        );
        tables.history.push(LoginRecord {
            name: identity.to_string(),
            time: now,
            ip,
            port,
        });

        Ok(())
    }

    fn record_logout(&self, identity: &str) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        if !tables.users.contains_key(identity) {
            return Err(StorageError::UnknownUser(identity.to_string()));
        }
        tables.active.remove(identity);
        Ok(())
    }

    fn record_message(&self, sender: &str, destination: &str) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        for name in [sender, destination] {
            if !tables.users.contains_key(name) {
                return Err(StorageError::UnknownUser(name.to_string()));
            }
        }
        if let Some(user) = tables.users.get_mut(sender) {
            user.sent += 1;
        }
        if let Some(user) = tables.users.get_mut(destination) {
            user.received += 1;
        }
        Ok(())
    }

    fn add_contact(&self, identity: &str, contact: &str) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        if identity == contact || !tables.users.contains_key(contact) {
            return Ok(());
        }
        let Some(user) = tables.users.get_mut(identity) else {
            return Err(StorageError::UnknownUser(identity.to_string()));
        };
        user.contacts.insert(contact.to_string());
        Ok(())
    }

    fn remove_contact(&self, identity: &str, contact: &str) -> Result<(), StorageError> {
        let mut tables = self.lock()?;
        let Some(user) = tables.users.get_mut(identity) else {
            return Err(StorageError::UnknownUser(identity.to_string()));
        };
        user.contacts.remove(contact);
        Ok(())
    }

    fn list_users(&self) -> Result<Vec<UserRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .users
            .iter()
            .map(|(name, user)| UserRecord {
                name: name.clone(),
                last_login: user.last_login,
            })
            .collect())
    }

    fn list_active(&self) -> Result<Vec<ActiveSession>, StorageError> {
        let tables = self.lock()?;
        Ok(tables.active.values().cloned().collect())
    }

    fn list_contacts(&self, identity: &str) -> Result<Vec<String>, StorageError> {
        let tables = self.lock()?;
        let user = tables
            .users
            .get(identity)
            .ok_or_else(|| StorageError::UnknownUser(identity.to_string()))?;
        Ok(user.contacts.iter().cloned().collect())
    }

    fn login_history(&self, identity: Option<&str>) -> Result<Vec<LoginRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .history
            .iter()
            .filter(|record| identity.map_or(true, |name| record.name == name))
            .cloned()
            .collect())
    }

    fn message_stats(&self) -> Result<Vec<MessageStats>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .users
            .iter()
            .map(|(name, user)| MessageStats {
                name: name.clone(),
                last_login: user.last_login,
                sent: user.sent,
                received: user.received,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn storage_with(names: &[&str]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        for (i, name) in names.iter().enumerate() {
            storage.record_login(name, LOCALHOST, 40000 + i as u16).unwrap();
        }
        storage
    }

    #[test]
    fn test_login_and_logout() {
        let storage = storage_with(&["Alice", "Bob"]);
        assert_eq!(storage.list_active().unwrap().len(), 2);

        storage.record_logout("Bob").unwrap();
        let active = storage.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "Alice");
        assert_eq!(active[0].port, 40000);

        // history is kept
        let users: Vec<_> = storage.list_users().unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(users, ["Alice", "Bob"]);
    }

    #[test]
    fn test_login_history_filter() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.record_login("Alice", LOCALHOST, 50000).unwrap();

        assert_eq!(storage.login_history(None).unwrap().len(), 3);
        let alice = storage.login_history(Some("Alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[1].port, 50000);
    }

    #[test]
    fn test_message_counters() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.record_message("Alice", "Bob").unwrap();
        storage.record_message("Alice", "Bob").unwrap();

        let stats = storage.message_stats().unwrap();
        let alice = stats.iter().find(|s| s.name == "Alice").unwrap();
        let bob = stats.iter().find(|s| s.name == "Bob").unwrap();
        assert_eq!((alice.sent, alice.received), (2, 0));
        assert_eq!((bob.sent, bob.received), (0, 2));

        assert!(matches!(
            storage.record_message("Alice", "Nobody"),
            Err(StorageError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_add_contact_idempotent() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.add_contact("Alice", "Bob").unwrap();
        storage.add_contact("Alice", "Bob").unwrap();
        assert_eq!(storage.list_contacts("Alice").unwrap(), ["Bob"]);

        // self edge and unknown contact are silent no-ops
        storage.add_contact("Alice", "Alice").unwrap();
        storage.add_contact("Alice", "Nobody").unwrap();
        assert_eq!(storage.list_contacts("Alice").unwrap(), ["Bob"]);
        assert!(storage.list_contacts("Bob").unwrap().is_empty());
    }

    #[test]
    fn test_remove_contact() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.add_contact("Alice", "Bob").unwrap();

        storage.remove_contact("Alice", "Bob").unwrap();
        assert!(storage.list_contacts("Alice").unwrap().is_empty());

        // missing edge is a no-op
        storage.remove_contact("Alice", "Bob").unwrap();
        storage.remove_contact("Alice", "Nobody").unwrap();
    }
}
