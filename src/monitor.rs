//! Topology notifications and the session monitor
//!
//! The relay bumps a generation counter in a `watch` channel every time the
//! set of logged-in identities changes. Observers only ever see the latest
//! generation, so a burst of logins costs one refresh.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::storage::Storage;

/// Sending half of the topology signal, owned by the relay
#[derive(Debug)]
pub struct Topology {
    tx: watch::Sender<u64>,
}

impl Topology {
    /// Create the signal and its first observer
    pub fn new() -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, rx)
    }

    /// Record that the registry changed
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

/// Log the active-session table whenever the topology changes
///
/// Returns once the relay drops its `Topology`, after logging the login
/// history and the per-user message counters.
pub async fn run(mut changes: watch::Receiver<u64>, storage: Arc<dyn Storage>) {
    info!("Monitor started");

    while changes.changed().await.is_ok() {
        let generation = *changes.borrow_and_update();
        match storage.list_active() {
            Ok(sessions) => {
                info!(
                    "Topology #{}: {} active session(s)",
                    generation,
                    sessions.len()
                );
                for s in sessions {
                    info!(
                        "  {} at {}:{} since {}",
                        s.name,
                        s.ip,
                        s.port,
                        s.login_time.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Err(e) => warn!("Monitor could not read active sessions: {}", e),
        }
    }

    match storage.login_history(None) {
        Ok(history) => {
            info!("Login history: {} login(s)", history.len());
            for record in history {
                info!(
                    "  {} from {}:{} at {}",
                    record.name,
                    record.ip,
                    record.port,
                    record.time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Err(e) => warn!("Monitor could not read login history: {}", e),
    }

    match storage.message_stats() {
        Ok(stats) => {
            for s in stats {
                info!(
                    "{}: last login {}, sent {}, received {}",
                    s.name,
                    s.last_login.format("%Y-%m-%d %H:%M:%S"),
                    s.sent,
                    s.received
                );
            }
        }
        Err(e) => warn!("Monitor could not read message stats: {}", e),
    }

    info!("Monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_notify_coalesces() {
        let (topology, mut rx) = Topology::new();
        assert_eq!(topology.generation(), 0);

        topology.notify();
        topology.notify();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_notify_without_observers() {
        let (topology, rx) = Topology::new();
        drop(rx);
        topology.notify();
        assert_eq!(topology.generation(), 1);
    }

    #[tokio::test]
    async fn test_monitor_exits_when_relay_drops_signal() {
        let (topology, rx) = Topology::new();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let handle = tokio::spawn(run(rx, storage));

        topology.notify();
        drop(topology);

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
    }
}
