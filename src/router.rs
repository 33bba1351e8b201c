//! Outbound router
//!
//! Holds accepted-but-undelivered messages and decides, once per service
//! cycle, which of them can go out right now.

use std::collections::{HashSet, VecDeque};

use crate::message::ChatMessage;
use crate::registry::Registry;
use crate::types::ConnId;

/// Message routed to a live connection this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub conn: ConnId,
    pub message: ChatMessage,
}

/// Result of one routing pass
#[derive(Debug, Default)]
pub struct RouteReport {
    /// Ready to write, in queue order
    pub delivered: Vec<Delivery>,
    /// Destination no longer registered; dropped from the queue
    pub unreachable: Vec<ChatMessage>,
}

/// Accepted message bound to the session it was addressed to
#[derive(Debug)]
struct Pending {
    conn: ConnId,
    message: ChatMessage,
}

/// FIFO pending-message queue
#[derive(Debug)]
pub struct Router {
    queue: VecDeque<Pending>,
    max_backlog: usize,
}

impl Router {
    /// Create a router allowing at most `max_backlog` queued messages per
    /// destination
    pub fn new(max_backlog: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_backlog,
        }
    }

    /// Queue `message` for the session currently living on `conn`
    pub fn enqueue(&mut self, conn: ConnId, message: ChatMessage) {
        self.queue.push_back(Pending { conn, message });
    }

    /// Number of queued messages addressed to `destination`
    pub fn backlog(&self, destination: &str) -> usize {
        self.queue
            .iter()
            .filter(|p| p.message.destination == destination)
            .count()
    }

    /// Whether `destination` can take another queued message
    pub fn has_room_for(&self, destination: &str) -> bool {
        self.backlog(destination) < self.max_backlog
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain the queue once
    ///
    /// Messages whose destination is writable are handed out, messages for
    /// registered-but-busy destinations stay queued in their original order,
    /// and messages for unregistered destinations are dropped into the
    /// report. A busy destination never holds up messages for others.
    ///
    /// A message only goes to the session it was accepted for: if the name
    /// has since been taken by another connection, it is unreachable.
    pub fn route(&mut self, registry: &Registry, writable: &HashSet<ConnId>) -> RouteReport {
        let mut report = RouteReport::default();
        let mut retained = VecDeque::with_capacity(self.queue.len());

        while let Some(pending) = self.queue.pop_front() {
            match registry.lookup(&pending.message.destination) {
                Some(conn) if conn != pending.conn => report.unreachable.push(pending.message),
                Some(conn) if writable.contains(&conn) => report.delivered.push(Delivery {
                    conn,
                    message: pending.message,
                }),
                Some(_) => retained.push_back(pending),
                None => report.unreachable.push(pending.message),
            }
        }

        self.queue = retained;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(from: &str, to: &str, text: &str) -> ChatMessage {
        ChatMessage {
            time: 0.0,
            sender: from.to_string(),
            destination: to.to_string(),
            mess_text: text.to_string(),
        }
    }

    #[test]
    fn test_delivers_in_fifo_order() {
        let mut registry = Registry::new();
        let bob = ConnId::new();
        registry.register("Bob", bob).unwrap();

        let mut router = Router::new(16);
        router.enqueue(bob, msg("Alice", "Bob", "one"));
        router.enqueue(bob, msg("Carol", "Bob", "two"));

        let report = router.route(&registry, &HashSet::from([bob]));
        let texts: Vec<_> = report
            .delivered
            .iter()
            .map(|d| d.message.mess_text.as_str())
            .collect();
        assert_eq!(texts, ["one", "two"]);
        assert!(report.delivered.iter().all(|d| d.conn == bob));
        assert!(router.is_empty());
    }

    #[test]
    fn test_busy_destination_does_not_block_others() {
        let mut registry = Registry::new();
        let bob = ConnId::new();
        let carol = ConnId::new();
        registry.register("Bob", bob).unwrap();
        registry.register("Carol", carol).unwrap();

        let mut router = Router::new(16);
        router.enqueue(bob, msg("Alice", "Bob", "first"));
        router.enqueue(carol, msg("Alice", "Carol", "second"));
        router.enqueue(bob, msg("Alice", "Bob", "third"));

        // Bob not writable this cycle
        let report = router.route(&registry, &HashSet::from([carol]));
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.delivered[0].message.mess_text, "second");
        assert_eq!(router.backlog("Bob"), 2);

        let report = router.route(&registry, &HashSet::from([bob, carol]));
        let texts: Vec<_> = report
            .delivered
            .iter()
            .map(|d| d.message.mess_text.as_str())
            .collect();
        assert_eq!(texts, ["first", "third"]);
    }

    #[test]
    fn test_unregistered_destination_dropped() {
        let registry = Registry::new();
        let mut router = Router::new(16);
        router.enqueue(ConnId::new(), msg("Alice", "Ghost", "boo"));

        let report = router.route(&registry, &HashSet::new());
        assert!(report.delivered.is_empty());
        assert_eq!(report.unreachable, vec![msg("Alice", "Ghost", "boo")]);
        assert!(router.is_empty());
    }

    #[test]
    fn test_backlog_limit() {
        let bob = ConnId::new();
        let mut router = Router::new(2);
        router.enqueue(bob, msg("Alice", "Bob", "1"));
        assert!(router.has_room_for("Bob"));
        router.enqueue(bob, msg("Alice", "Bob", "2"));
        assert!(!router.has_room_for("Bob"));
        assert!(router.has_room_for("Carol"));
    }

    #[test]
    fn test_name_reused_by_new_connection_is_unreachable() {
        let mut registry = Registry::new();
        let old_bob = ConnId::new();
        registry.register("Bob", old_bob).unwrap();

        let mut router = Router::new(16);
        router.enqueue(old_bob, msg("Alice", "Bob", "for the old session"));

        // old session dropped and a new connection logged in as Bob
        registry.unregister_connection(old_bob);
        let new_bob = ConnId::new();
        registry.register("Bob", new_bob).unwrap();

        let report = router.route(&registry, &HashSet::from([new_bob]));
        assert!(report.delivered.is_empty());
        assert_eq!(report.unreachable, vec![msg("Alice", "Bob", "for the old session")]);
        assert!(router.is_empty());
    }
}
