//! SQLite-backed store
//!
//! One dedicated thread owns the database connection. Mutations are queued
//! to it and return immediately, so the service loop never waits on disk;
//! reads travel the same queue and therefore see every earlier mutation.

use std::net::IpAddr;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{ActiveSession, LoginRecord, MessageStats, Storage, UserRecord};
use crate::error::StorageError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    name        TEXT PRIMARY KEY,
    last_login  TEXT NOT NULL,
    sent        INTEGER NOT NULL DEFAULT 0,
    received    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS active_sessions (
    name        TEXT PRIMARY KEY REFERENCES users(name),
    ip          TEXT NOT NULL,
    port        INTEGER NOT NULL,
    login_time  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS login_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL REFERENCES users(name),
    time        TEXT NOT NULL,
    ip          TEXT NOT NULL,
    port        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS login_history_by_name ON login_history(name);

CREATE TABLE IF NOT EXISTS contacts (
    owner       TEXT NOT NULL REFERENCES users(name),
    contact     TEXT NOT NULL REFERENCES users(name),
    PRIMARY KEY (owner, contact)
);
";

type Query = Box<dyn FnOnce(&Connection) + Send>;

enum Command {
    Login {
        identity: String,
        ip: IpAddr,
        port: u16,
    },
    Logout {
        identity: String,
    },
    Message {
        sender: String,
        destination: String,
    },
    AddContact {
        identity: String,
        contact: String,
    },
    RemoveContact {
        identity: String,
        contact: String,
    },
    Read(Query),
}

/// Store persisted in a SQLite database file
#[derive(Debug)]
pub struct SqliteStorage {
    location: String,
    commands: Option<Sender<Command>>,
    writer: Option<JoinHandle<()>>,
}

impl SqliteStorage {
    /// Open or create the database at `path`
    ///
    /// Active sessions from a previous run are discarded since none of those
    /// connections survived the restart.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::start(conn, path.display().to_string())
    }

    /// Database that lives only as long as this value
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::start(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn start(conn: Connection, location: String) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        let stale = conn.execute("DELETE FROM active_sessions", [])?;
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        info!(
            "Storage opened at {} ({} known users, {} stale sessions cleared)",
            location, users, stale
        );

        let (tx, rx) = mpsc::channel();
        let writer = thread::Builder::new()
            .name("storage-writer".to_string())
            .spawn(move || run_writer(conn, rx))?;

        Ok(Self {
            location,
            commands: Some(tx),
            writer: Some(writer),
        })
    }

    /// Where the database lives
    pub fn location(&self) -> &str {
        &self.location
    }

    fn submit(&self, command: Command) -> Result<(), StorageError> {
        self.commands
            .as_ref()
            .ok_or(StorageError::WriterStopped)?
            .send(command)
            .map_err(|_| StorageError::WriterStopped)
    }

    /// Run `f` on the writer thread after all queued mutations
    fn read<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let (reply, result) = mpsc::sync_channel(1);
        self.submit(Command::Read(Box::new(move |conn: &Connection| {
            let _ = reply.send(f(conn));
        })))?;
        result.recv().map_err(|_| StorageError::WriterStopped)?
    }
}

impl Drop for SqliteStorage {
    fn drop(&mut self) {
        // closing the queue lets the writer drain what is left and exit
        self.commands.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("Storage writer for {} panicked", self.location);
            }
        }
    }
}

fn run_writer(mut conn: Connection, commands: Receiver<Command>) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Read(query) => query(&conn),
            command => {
                if let Err(e) = apply(&mut conn, command) {
                    warn!("Storage write failed: {}", e);
                }
            }
        }
    }
    debug!("Storage writer stopped");
}

fn apply(conn: &mut Connection, command: Command) -> Result<(), StorageError> {
    match command {
        Command::Login { identity, ip, port } => {
            let now = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (name, last_login) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET last_login = excluded.last_login",
                params![identity, now],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO active_sessions (name, ip, port, login_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![identity, ip.to_string(), port, now],
            )?;
            tx.execute(
                "INSERT INTO login_history (name, time, ip, port) VALUES (?1, ?2, ?3, ?4)",
                params![identity, now, ip.to_string(), port],
            )?;
            tx.commit()?;
        }
        Command::Logout { identity } => {
            ensure_known(conn, &identity)?;
            conn.execute("DELETE FROM active_sessions WHERE name = ?1", [&identity])?;
        }
        Command::Message {
            sender,
            destination,
        } => {
            ensure_known(conn, &sender)?;
            ensure_known(conn, &destination)?;
            let tx = conn.transaction()?;
            tx.execute("UPDATE users SET sent = sent + 1 WHERE name = ?1", [&sender])?;
            tx.execute(
                "UPDATE users SET received = received + 1 WHERE name = ?1",
                [&destination],
            )?;
            tx.commit()?;
        }
        Command::AddContact { identity, contact } => {
            ensure_known(conn, &identity)?;
            if identity != contact {
                conn.execute(
                    "INSERT OR IGNORE INTO contacts (owner, contact)
                     SELECT ?1, name FROM users WHERE name = ?2",
                    [&identity, &contact],
                )?;
            }
        }
        Command::RemoveContact { identity, contact } => {
            ensure_known(conn, &identity)?;
            conn.execute(
                "DELETE FROM contacts WHERE owner = ?1 AND contact = ?2",
                [&identity, &contact],
            )?;
        }
        Command::Read(query) => query(conn),
    }
    Ok(())
}

fn ensure_known(conn: &Connection, identity: &str) -> Result<(), StorageError> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE name = ?1", [identity], |_| Ok(()))
        .optional()?;
    found.ok_or_else(|| StorageError::UnknownUser(identity.to_string()))
}

fn ip_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<IpAddr> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl Storage for SqliteStorage {
    fn record_login(&self, identity: &str, ip: IpAddr, port: u16) -> Result<(), StorageError> {
        self.submit(Command::Login {
            identity: identity.to_string(),
            ip,
            port,
        })
    }

    fn record_logout(&self, identity: &str) -> Result<(), StorageError> {
        self.submit(Command::Logout {
            identity: identity.to_string(),
        })
    }

    fn record_message(&self, sender: &str, destination: &str) -> Result<(), StorageError> {
        self.submit(Command::Message {
            sender: sender.to_string(),
            destination: destination.to_string(),
        })
    }

    fn add_contact(&self, identity: &str, contact: &str) -> Result<(), StorageError> {
        self.submit(Command::AddContact {
            identity: identity.to_string(),
            contact: contact.to_string(),
        })
    }

    fn remove_contact(&self, identity: &str, contact: &str) -> Result<(), StorageError> {
        self.submit(Command::RemoveContact {
            identity: identity.to_string(),
            contact: contact.to_string(),
        })
    }

    fn list_users(&self) -> Result<Vec<UserRecord>, StorageError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT name, last_login FROM users ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok(UserRecord {
                    name: row.get(0)?,
                    last_login: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn list_active(&self) -> Result<Vec<ActiveSession>, StorageError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, ip, port, login_time FROM active_sessions ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ActiveSession {
                    name: row.get(0)?,
                    ip: ip_column(row, 1)?,
                    port: row.get(2)?,
                    login_time: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn list_contacts(&self, identity: &str) -> Result<Vec<String>, StorageError> {
        let identity = identity.to_string();
        self.read(move |conn| {
            ensure_known(conn, &identity)?;
            let mut stmt =
                conn.prepare("SELECT contact FROM contacts WHERE owner = ?1 ORDER BY contact")?;
            let rows = stmt.query_map([&identity], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn login_history(&self, identity: Option<&str>) -> Result<Vec<LoginRecord>, StorageError> {
        let identity = identity.map(str::to_string);
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, time, ip, port FROM login_history
                 WHERE ?1 IS NULL OR name = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([&identity], |row| {
                Ok(LoginRecord {
                    name: row.get(0)?,
                    time: row.get(1)?,
                    ip: ip_column(row, 2)?,
                    port: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    fn message_stats(&self) -> Result<Vec<MessageStats>, StorageError> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT name, last_login, sent, received FROM users ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok(MessageStats {
                    name: row.get(0)?,
                    last_login: row.get(1)?,
                    sent: row.get(2)?,
                    received: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn storage_with(names: &[&str]) -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        for (i, name) in names.iter().enumerate() {
            storage.record_login(name, LOCALHOST, 40000 + i as u16).unwrap();
        }
        storage
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("chat_relay_{}.db", uuid::Uuid::new_v4()))
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }

    #[test]
    fn test_reads_see_queued_writes() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.add_contact("Alice", "Bob").unwrap();

        assert_eq!(storage.list_contacts("Alice").unwrap(), ["Bob"]);
        let active: Vec<_> = storage.list_active().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(active, ["Alice", "Bob"]);
        assert_eq!(storage.list_active().unwrap()[1].port, 40001);
    }

    #[test]
    fn test_logout_keeps_user() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.record_logout("Bob").unwrap();

        let active: Vec<_> = storage.list_active().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(active, ["Alice"]);
        let users: Vec<_> = storage.list_users().unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(users, ["Alice", "Bob"]);
    }

    #[test]
    fn test_message_counters() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.record_message("Alice", "Bob").unwrap();
        storage.record_message("Alice", "Bob").unwrap();
        // unknown destination is logged by the writer and changes nothing
        storage.record_message("Alice", "Nobody").unwrap();

        let stats = storage.message_stats().unwrap();
        assert_eq!((stats[0].name.as_str(), stats[0].sent, stats[0].received), ("Alice", 2, 0));
        assert_eq!((stats[1].name.as_str(), stats[1].sent, stats[1].received), ("Bob", 0, 2));
    }

    #[test]
    fn test_contact_edges() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.add_contact("Alice", "Bob").unwrap();
        storage.add_contact("Alice", "Bob").unwrap();
        storage.add_contact("Alice", "Alice").unwrap();
        storage.add_contact("Alice", "Nobody").unwrap();
        assert_eq!(storage.list_contacts("Alice").unwrap(), ["Bob"]);
        assert!(storage.list_contacts("Bob").unwrap().is_empty());

        storage.remove_contact("Alice", "Bob").unwrap();
        storage.remove_contact("Alice", "Bob").unwrap();
        assert!(storage.list_contacts("Alice").unwrap().is_empty());

        assert!(matches!(
            storage.list_contacts("Nobody"),
            Err(StorageError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_login_history_filter() {
        let storage = storage_with(&["Alice", "Bob"]);
        storage.record_login("Alice", LOCALHOST, 50000).unwrap();

        assert_eq!(storage.login_history(None).unwrap().len(), 3);
        let alice = storage.login_history(Some("Alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[1].port, 50000);
        assert_eq!(alice[1].ip, LOCALHOST);
    }

    #[test]
    fn test_reopen_keeps_data_and_clears_sessions() {
        let path = temp_db_path();

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.record_login("Alice", LOCALHOST, 40000).unwrap();
            storage.record_login("Bob", LOCALHOST, 40001).unwrap();
            storage.add_contact("Alice", "Bob").unwrap();
            storage.record_message("Alice", "Bob").unwrap();
            // dropped with writes possibly still queued
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert!(storage.list_active().unwrap().is_empty());
        assert_eq!(storage.list_users().unwrap().len(), 2);
        assert_eq!(storage.list_contacts("Alice").unwrap(), ["Bob"]);
        assert_eq!(storage.login_history(None).unwrap().len(), 2);
        assert_eq!(storage.message_stats().unwrap()[0].sent, 1);

        drop(storage);
        remove_db(&path);
    }

    #[test]
    fn test_many_logins_survive_reopen() {
        let path = temp_db_path();
        {
            let storage = SqliteStorage::open(&path).unwrap();
            for i in 0..200u16 {
                storage.record_login(&format!("user{i:03}"), LOCALHOST, 40000 + i).unwrap();
            }
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.list_users().unwrap().len(), 200);
        assert_eq!(storage.login_history(Some("user199")).unwrap()[0].port, 40199);

        drop(storage);
        remove_db(&path);
    }
}
