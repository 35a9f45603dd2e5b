//! Broadcast Channel
//!
//! Registry of member outboxes. Sends never block and never retry: a member
//! that misses a snapshot converges on the next one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::sync::{MemberId, ServerMessage};

struct Outbox {
    connection_id: u64,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

/// Error type for targeted sends
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The member has no registered connection
    #[error("Member is not connected")]
    NotConnected,
    /// The connection's receiver is gone
    #[error("Connection closed")]
    Disconnected,
}

#[derive(Default)]
pub struct Broadcaster {
    outboxes: RwLock<HashMap<MemberId, Outbox>>,
    next_connection_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member connection, replacing any previous one.
    ///
    /// Returns the connection id (needed to unregister) and the receiver the
    /// caller forwards to the socket.
    pub fn register(&self, member_id: &str) -> (u64, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let replaced = self.outboxes.write().insert(
            member_id.to_string(),
            Outbox {
                connection_id,
                sender: tx,
            },
        );
        if replaced.is_some() {
            debug!("Replaced existing connection for {}", member_id);
        }

        (connection_id, rx)
    }

    /// Remove a connection; ignored if it was already replaced by a newer one
    pub fn unregister(&self, member_id: &str, connection_id: u64) -> bool {
        let mut outboxes = self.outboxes.write();
        match outboxes.get(member_id) {
            Some(outbox) if outbox.connection_id == connection_id => {
                outboxes.remove(member_id);
                true
            }
            _ => false,
        }
    }

    pub fn send_to(&self, member_id: &str, message: ServerMessage) -> Result<(), SendError> {
        let outboxes = self.outboxes.read();
        let outbox = outboxes.get(member_id).ok_or(SendError::NotConnected)?;
        outbox
            .sender
            .send(message)
            .map_err(|_| SendError::Disconnected)
    }

    /// Deliver one message to each listed member; returns how many were reached
    pub fn fan_out<'a, I>(&self, members: I, message: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let outboxes = self.outboxes.read();
        members
            .into_iter()
            .filter_map(|id| outboxes.get(id))
            .filter(|outbox| outbox.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Deliver to every registered connection
    pub fn broadcast_all(&self, message: &ServerMessage) -> usize {
        let outboxes = self.outboxes.read();
        outboxes
            .values()
            .filter(|outbox| outbox.sender.send(message.clone()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::RejectReason;

    fn rejected() -> ServerMessage {
        ServerMessage::ActionRejected {
            reason: RejectReason::NotPermitted,
        }
    }

    #[test]
    fn test_fan_out_reaches_listed_members_only() {
        let broadcaster = Broadcaster::new();
        let (_, mut alice) = broadcaster.register("alice");
        let (_, mut bob) = broadcaster.register("bob");

        let reached = broadcaster.fan_out(["alice", "ghost"], &rejected());
        assert_eq!(reached, 1);
        assert_eq!(alice.try_recv().unwrap(), rejected());
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn test_stale_unregister_keeps_new_connection() {
        let broadcaster = Broadcaster::new();
        let (old_id, _old_rx) = broadcaster.register("alice");
        let (new_id, mut new_rx) = broadcaster.register("alice");

        assert!(!broadcaster.unregister("alice", old_id));
        broadcaster.send_to("alice", rejected()).unwrap();
        assert!(new_rx.try_recv().is_ok());

        assert!(broadcaster.unregister("alice", new_id));
        assert_eq!(broadcaster.send_to("alice", rejected()), Err(SendError::NotConnected));
    }

    #[test]
    fn test_dropped_receiver_is_reported() {
        let broadcaster = Broadcaster::new();
        let (_, rx) = broadcaster.register("alice");
        drop(rx);

        let err = broadcaster.send_to("alice", rejected()).unwrap_err();
        assert_eq!(err, SendError::Disconnected);
        assert_eq!(err.to_string(), "Connection closed");
        assert_eq!(broadcaster.broadcast_all(&rejected()), 0);
    }
}
