//! Accept-and-service loop
//!
//! Accepts connections, polls them through the multiplexer, feeds inbound
//! frames to the relay and writes back whatever the relay produces. Every
//! per-connection failure ends in `close`, which keeps the relay state in
//! step with the socket set; nothing in here can stop the loop once it runs.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::message::{ClientMessage, ServerMessage};
use crate::monitor::Topology;
use crate::multiplexer::Multiplexer;
use crate::server::Relay;
use crate::storage::Storage;
use crate::types::ConnId;

/// Loop timing and limits
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// How long one accept attempt may wait
    pub accept_timeout: Duration,
    /// Upper bound on one multiplexer wait
    pub poll_interval: Duration,
    /// Largest inbound frame
    pub max_frame_bytes: usize,
    /// Most unsent bytes held for one slow reader
    pub max_outbound_bytes: usize,
    /// Largest per-recipient queue
    pub max_backlog: usize,
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            accept_timeout: Duration::from_millis(config.accept_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_frame_bytes: config.max_frame_bytes,
            max_outbound_bytes: config.max_outbound_bytes,
            max_backlog: config.max_backlog,
        }
    }
}

/// The relay bound to a listening socket
pub struct RelayService {
    listener: TcpListener,
    connections: Multiplexer,
    relay: Relay,
    settings: ServiceSettings,
}

impl RelayService {
    /// Bind the listener
    ///
    /// A bind failure is fatal and is returned before any client is served.
    pub async fn bind(
        addr: SocketAddr,
        settings: ServiceSettings,
        storage: Arc<dyn Storage>,
        topology: Topology,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            connections: Multiplexer::new(),
            relay: Relay::new(storage, topology, settings.max_backlog),
            settings,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Serve forever
    pub async fn run(mut self) {
        info!("Relay service started");
        loop {
            self.tick().await;
        }
    }

    /// One service cycle: accept, poll, dispatch, route
    pub async fn tick(&mut self) {
        self.accept().await;

        let readiness = self.connections.poll(self.settings.poll_interval).await;

        for id in readiness.errored {
            self.close(id, "socket error");
        }

        for id in readiness.readable {
            self.service(id);
        }

        self.flush_pending(&readiness.writable);
        self.deliver(&readiness.writable);
    }

    /// Accept one connection within the timeout, then any already queued
    async fn accept(&mut self) {
        match tokio::time::timeout(self.settings.accept_timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => self.track(stream, peer),
            Ok(Err(e)) => {
                warn!("Failed to accept connection: {}", e);
                return;
            }
            // timeout: nobody knocking
            Err(_) => return,
        }

        while let Some(result) = self.listener.accept().now_or_never() {
            match result {
                Ok((stream, peer)) => self.track(stream, peer),
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }

    fn track(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }
        let conn = Connection::new(
            stream,
            peer,
            self.settings.max_frame_bytes,
            self.settings.max_outbound_bytes,
        );
        info!("New connection {} from {}", conn.id, peer);
        self.relay.open(conn.id, peer);
        self.connections.insert(conn);
    }

    /// Read and dispatch one frame from a readable connection
    fn service(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        let frame = match conn.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                self.close(id, &e.to_string());
                return;
            }
        };

        let outcome = match self.relay.receive(id, &frame) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", id, e);
                self.close(id, "undecodable frame");
                return;
            }
        };

        if let Some(reply) = outcome.reply {
            if let Err(e) = self.write(id, &reply.into()) {
                self.close(id, &e.to_string());
                return;
            }
        }

        if outcome.close {
            self.close(id, "session ended");
        }
    }

    /// Retry leftover output on connections that became writable
    fn flush_pending(&mut self, writable: &HashSet<ConnId>) {
        let mut failed = Vec::new();
        for id in writable {
            if let Some(conn) = self.connections.get_mut(*id) {
                if conn.has_pending_output() {
                    if let Err(e) = conn.flush() {
                        failed.push((*id, e));
                    }
                }
            }
        }
        for (id, e) in failed {
            self.close(id, &e.to_string());
        }
    }

    /// Run the router and write its output
    fn deliver(&mut self, writable: &HashSet<ConnId>) {
        for (id, frame) in self.relay.route(writable) {
            if let Err(e) = self.write(id, &frame) {
                self.close(id, &e.to_string());
                // a relayed message that could not be written is unreachable
                if let ServerMessage::Relay(ClientMessage::Message(message)) = frame {
                    if let Some((sender, notice)) = self.relay.delivery_failed(message) {
                        if let Err(e) = self.write(sender, &notice) {
                            self.close(sender, &e.to_string());
                        }
                    }
                }
            }
        }
    }

    fn write(&mut self, id: ConnId, frame: &ServerMessage) -> Result<(), TransportError> {
        match self.connections.get_mut(id) {
            Some(conn) => conn.send(frame),
            None => Err(TransportError::Closed),
        }
    }

    /// Session lifecycle exit point for every connection
    fn close(&mut self, id: ConnId, reason: &str) {
        let Some(mut conn) = self.connections.remove(id) else {
            return;
        };
        if conn.has_pending_output() {
            // last chance for a farewell reply; the socket goes away regardless
            if let Err(e) = conn.flush() {
                debug!("Final flush to {} failed: {}", id, e);
            }
        }
        debug!("Closing {} ({}): {}", id, conn.peer, reason);
        self.relay.close(id);
    }
}
