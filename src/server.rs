//! Relay core
//!
//! The central state of the chat relay: who is online, what is waiting to be
//! delivered, and how each request changes that. Nothing in here touches a
//! socket; the service loop feeds it decoded frames and writes out whatever
//! it hands back.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{CodecError, RelayError};
use crate::message::{ChatMessage, ClientMessage, Response, ServerMessage};
use crate::monitor::Topology;
use crate::registry::Registry;
use crate::router::Router;
use crate::storage::Storage;
use crate::types::ConnId;

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not logged in yet
    Accepted,
    /// Logged in under an identity
    Authenticated,
    /// Gone (or never seen)
    Closed,
}

/// What the service loop should do after a request
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Reply for the requesting connection
    pub reply: Option<Response>,
    /// Close the requesting connection after sending the reply
    pub close: bool,
}

impl Outcome {
    fn reply(response: Response) -> Self {
        Self {
            reply: Some(response),
            close: false,
        }
    }

    fn close() -> Self {
        Self {
            reply: None,
            close: true,
        }
    }
}

impl From<RelayError> for Outcome {
    fn from(err: RelayError) -> Self {
        let close = matches!(err, RelayError::NameTaken(_));
        Self {
            reply: Some(err.into()),
            close,
        }
    }
}

/// The relay state machine
///
/// Owned by a single service loop, so registry and queue need no locking.
pub struct Relay {
    /// Logged-in identities
    registry: Registry,
    /// Accepted, undelivered messages
    router: Router,
    /// Every open connection and its peer address
    peers: HashMap<ConnId, SocketAddr>,
    /// Persistence collaborator
    storage: Arc<dyn Storage>,
    /// Registry change signal for observers
    topology: Topology,
}

impl Relay {
    /// Create a relay with at most `max_backlog` queued messages per recipient
    pub fn new(storage: Arc<dyn Storage>, topology: Topology, max_backlog: usize) -> Self {
        Self {
            registry: Registry::new(),
            router: Router::new(max_backlog),
            peers: HashMap::new(),
            storage,
            topology,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of messages waiting for delivery
    pub fn pending(&self) -> usize {
        self.router.len()
    }

    /// Track a freshly accepted connection
    pub fn open(&mut self, conn: ConnId, peer: SocketAddr) {
        debug!("Connection {} opened from {}", conn, peer);
        self.peers.insert(conn, peer);
    }

    pub fn session_state(&self, conn: ConnId) -> SessionState {
        if self.registry.identity_of(conn).is_some() {
            SessionState::Authenticated
        } else if self.peers.contains_key(&conn) {
            SessionState::Accepted
        } else {
            SessionState::Closed
        }
    }

    /// Decode one frame and dispatch it
    ///
    /// A frame that is not a JSON object is returned as an error and the
    /// caller should drop the connection. A well-formed object with the wrong
    /// shape is answered with a bad-request reply instead.
    pub fn receive(&mut self, conn: ConnId, frame: &[u8]) -> Result<Outcome, CodecError> {
        let value = codec::decode(frame)?;
        let outcome = match ClientMessage::from_value(value) {
            Ok(msg) => self.dispatch(conn, msg),
            Err(err) => {
                debug!("Malformed request from {}", conn);
                err.into()
            }
        };
        Ok(outcome)
    }

    /// Execute one validated request
    pub fn dispatch(&mut self, conn: ConnId, msg: ClientMessage) -> Outcome {
        debug!("Dispatching {} from {}", msg.action(), conn);

        let result = match msg {
            ClientMessage::Presence { user, .. } => self.handle_presence(conn, user.account_name),
            ClientMessage::Message(chat) => self.handle_message(conn, chat),
            ClientMessage::Exit { account_name, .. } => self.handle_exit(conn, &account_name),
            ClientMessage::GetContacts { user, .. } => self.handle_get_contacts(conn, &user),
            ClientMessage::AddContact {
                user, account_name, ..
            } => self.handle_add_contact(conn, &user, &account_name),
            ClientMessage::RemoveContact {
                user, account_name, ..
            } => self.handle_remove_contact(conn, &user, &account_name),
            ClientMessage::UsersRequest { account_name, .. } => {
                self.handle_users_request(conn, &account_name)
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Rejected request from {}: {}", conn, err);
                err.into()
            }
        }
    }

    /// Handle login
    fn handle_presence(&mut self, conn: ConnId, name: String) -> Result<Outcome, RelayError> {
        let Some(peer) = self.peers.get(&conn).copied() else {
            return Err(RelayError::BadRequest);
        };

        if self.registry.identity_of(conn).is_some() {
            return Err(RelayError::AlreadyAuthenticated);
        }

        if self.registry.register(&name, conn).is_err() {
            return Err(RelayError::NameTaken(name));
        }

        info!("{} logged in from {} on {}", name, peer, conn);
        if let Err(e) = self.storage.record_login(&name, peer.ip(), peer.port()) {
            warn!("Failed to record login of {}: {}", name, e);
        }
        self.topology.notify();

        Ok(Outcome::reply(Response::ok()))
    }

    /// Handle direct message
    fn handle_message(&mut self, conn: ConnId, msg: ChatMessage) -> Result<Outcome, RelayError> {
        self.ensure_owner(conn, &msg.sender)?;

        let Some(target) = self.registry.lookup(&msg.destination) else {
            return Err(RelayError::RecipientUnknown(msg.destination));
        };
        if !self.router.has_room_for(&msg.destination) {
            return Err(RelayError::BacklogFull(msg.destination));
        }

        if let Err(e) = self.storage.record_message(&msg.sender, &msg.destination) {
            warn!(
                "Failed to record message {} -> {}: {}",
                msg.sender, msg.destination, e
            );
        }
        debug!("Queued message {} -> {}", msg.sender, msg.destination);
        self.router.enqueue(target, msg);

        Ok(Outcome::reply(Response::ok()))
    }

    /// Handle graceful logout
    fn handle_exit(&mut self, conn: ConnId, name: &str) -> Result<Outcome, RelayError> {
        self.ensure_owner(conn, name)?;
        info!("{} logged out", name);
        self.end_session(conn);
        Ok(Outcome::close())
    }

    /// Handle contact list request
    fn handle_get_contacts(&mut self, conn: ConnId, name: &str) -> Result<Outcome, RelayError> {
        self.ensure_owner(conn, name)?;
        let contacts = self.storage.list_contacts(name)?;
        Ok(Outcome::reply(Response::list(contacts)))
    }

    /// Handle contact addition
    fn handle_add_contact(
        &mut self,
        conn: ConnId,
        name: &str,
        contact: &str,
    ) -> Result<Outcome, RelayError> {
        self.ensure_owner(conn, name)?;
        if let Err(e) = self.storage.add_contact(name, contact) {
            warn!("Failed to add contact {} for {}: {}", contact, name, e);
        }
        Ok(Outcome::reply(Response::ok()))
    }

    /// Handle contact removal
    fn handle_remove_contact(
        &mut self,
        conn: ConnId,
        name: &str,
        contact: &str,
    ) -> Result<Outcome, RelayError> {
        self.ensure_owner(conn, name)?;
        if let Err(e) = self.storage.remove_contact(name, contact) {
            warn!("Failed to remove contact {} for {}: {}", contact, name, e);
        }
        Ok(Outcome::reply(Response::ok()))
    }

    /// Handle known-users request
    fn handle_users_request(&mut self, conn: ConnId, name: &str) -> Result<Outcome, RelayError> {
        self.ensure_owner(conn, name)?;
        let users = self
            .storage
            .list_users()?
            .into_iter()
            .map(|user| user.name)
            .collect();
        Ok(Outcome::reply(Response::list(users)))
    }

    /// Helper: the claimed identity must be bound to exactly this connection
    fn ensure_owner(&self, conn: ConnId, identity: &str) -> Result<(), RelayError> {
        if self.registry.lookup(identity) == Some(conn) {
            Ok(())
        } else {
            Err(RelayError::NotOwner(identity.to_string()))
        }
    }

    /// Helper: unbind the connection's identity and record the logout
    fn end_session(&mut self, conn: ConnId) -> Option<String> {
        let name = self.registry.unregister_connection(conn)?;
        if let Err(e) = self.storage.record_logout(&name) {
            warn!("Failed to record logout of {}: {}", name, e);
        }
        self.topology.notify();
        Some(name)
    }

    /// Connection is gone, for whatever reason
    ///
    /// Returns the identity it was logged in as, if any. Messages still
    /// queued for that identity get one more routing pass and are then
    /// reported as unreachable.
    pub fn close(&mut self, conn: ConnId) -> Option<String> {
        let peer = self.peers.remove(&conn);
        let name = self.end_session(conn);
        match (&name, peer) {
            (Some(name), _) => info!("{} disconnected", name),
            (None, Some(peer)) => debug!("Unauthenticated connection {} from {} closed", conn, peer),
            (None, None) => {}
        }
        name
    }

    /// Route queued messages to the connections that can take a write now
    ///
    /// Returns the frames to write. Messages whose recipient is gone turn
    /// into a notice for their sender, if the sender is still online.
    pub fn route(&mut self, writable: &HashSet<ConnId>) -> Vec<(ConnId, ServerMessage)> {
        let report = self.router.route(&self.registry, writable);
        let mut frames = Vec::with_capacity(report.delivered.len());

        for delivery in report.delivered {
            info!(
                "Delivering message from {} to {}",
                delivery.message.sender, delivery.message.destination
            );
            frames.push((delivery.conn, delivery.message.into()));
        }

        for message in report.unreachable {
            if let Some(notice) = self.delivery_failed(message) {
                frames.push(notice);
            }
        }

        frames
    }

    /// A message could not be handed to its recipient
    ///
    /// Returns the notice to send back to the sender, if still online.
    pub fn delivery_failed(&mut self, message: ChatMessage) -> Option<(ConnId, ServerMessage)> {
        warn!(
            "{} is not connected, dropping message from {}",
            message.destination, message.sender
        );
        let sender = self.registry.lookup(&message.sender)?;
        Some((sender, RelayError::RecipientGone(message.destination).into()))
    }
}
