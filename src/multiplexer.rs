//! Readiness multiplexer
//!
//! Owns every accepted connection and reports, once per service cycle, which
//! of them can be read, which can be written and which are broken. One
//! bounded wait covers all connections, so no connection gets its own task.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::future;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::types::ConnId;

/// Readiness snapshot for one cycle
///
/// `errored` never overlaps the other two sets; `readable` and `writable`
/// can share members.
#[derive(Debug, Default)]
pub struct Readiness {
    pub readable: Vec<ConnId>,
    pub writable: HashSet<ConnId>,
    pub errored: Vec<ConnId>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.errored.is_empty()
    }
}

/// Set of live connections
#[derive(Debug, Default)]
pub struct Multiplexer {
    connections: HashMap<ConnId, Connection>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) {
        debug!("Tracking connection {} from {}", conn.id, conn.peer);
        self.connections.insert(conn.id, conn);
    }

    /// Stop tracking a connection; dropping the result closes the socket
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Wait at most `wait` for inbound data, then classify every connection
    ///
    /// The wait is skipped when some connection already holds a buffered
    /// frame or a pending EOF.
    pub async fn poll(&mut self, wait: Duration) -> Readiness {
        if self.connections.is_empty() {
            return Readiness::default();
        }

        let buffered = self.connections.values().any(Connection::has_buffered_input);
        if !buffered {
            let waits = self
                .connections
                .values()
                .map(|conn| Box::pin(conn.readable()));
            // a timeout here just means nothing arrived
            let _ = tokio::time::timeout(wait, future::select_all(waits)).await;
        }

        let mut readiness = Readiness::default();
        for (id, conn) in &self.connections {
            match conn.readiness() {
                Ok(Some(ready)) if ready.is_error() => {
                    debug!("Connection {} has a pending socket error", id);
                    readiness.errored.push(*id);
                }
                Ok(ready) => {
                    let socket_readable = ready.map_or(false, |r| r.is_readable() || r.is_read_closed());
                    if socket_readable || conn.has_buffered_input() {
                        readiness.readable.push(*id);
                    }
                    if ready.map_or(false, |r| r.is_writable()) {
                        readiness.writable.insert(*id);
                    }
                }
                Err(e) => {
                    warn!("Connection {} in error state: {}", id, e);
                    readiness.errored.push(*id);
                }
            }
        }
        readiness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn accept_into(mux: &mut Multiplexer, listener: &TcpListener) -> (ConnId, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let conn = Connection::new(stream, peer, 1024, 64 * 1024);
        let id = conn.id;
        mux.insert(conn);
        (id, client)
    }

    #[tokio::test]
    async fn test_empty_poll_returns_immediately() {
        let mut mux = Multiplexer::new();
        let readiness = mux.poll(Duration::from_secs(60)).await;
        assert!(readiness.is_empty());
    }

    #[tokio::test]
    async fn test_poll_reports_readable_connection_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = Multiplexer::new();
        let (quiet, _quiet_client) = accept_into(&mut mux, &listener).await;
        let (chatty, mut chatty_client) = accept_into(&mut mux, &listener).await;

        chatty_client.write_all(b"{}\n").await.unwrap();

        let readiness = mux.poll(Duration::from_secs(5)).await;
        assert_eq!(readiness.readable, vec![chatty]);
        assert!(!readiness.readable.contains(&quiet));
        assert!(readiness.errored.is_empty());

        let frame = mux.get_mut(chatty).unwrap().read_frame().unwrap();
        assert_eq!(frame.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn test_poll_times_out_without_traffic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = Multiplexer::new();
        let (id, _client) = accept_into(&mut mux, &listener).await;

        let readiness = mux.poll(Duration::from_millis(50)).await;
        assert!(readiness.readable.is_empty());
        assert!(readiness.writable.contains(&id));
    }

    #[tokio::test]
    async fn test_peer_reset_reported_as_errored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = Multiplexer::new();
        let (healthy, _healthy_client) = accept_into(&mut mux, &listener).await;
        let (reset, reset_client) = accept_into(&mut mux, &listener).await;

        // zero linger turns the close into an RST
        #[allow(deprecated)]
        reset_client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(reset_client);

        let mut errored = Vec::new();
        for _ in 0..50 {
            let readiness = mux.poll(Duration::from_millis(100)).await;
            if !readiness.errored.is_empty() {
                assert!(!readiness.readable.contains(&reset));
                assert!(!readiness.writable.contains(&reset));
                errored = readiness.errored;
                break;
            }
        }
        assert_eq!(errored, vec![reset]);
        assert!(!errored.contains(&healthy));
    }

    #[tokio::test]
    async fn test_remove_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut mux = Multiplexer::new();
        let (id, _client) = accept_into(&mut mux, &listener).await;

        assert!(mux.contains(id));
        assert!(mux.remove(id).is_some());
        assert!(mux.is_empty());
    }
}
