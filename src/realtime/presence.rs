//! Room Presence
//!
//! Tracks which connections have joined which rooms and fans events out to
//! them. This is delivery bookkeeping only; authorization never reads it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::core::{RoomId, UserId};
use crate::realtime::protocol::ServerMessage;

/// Server-assigned connection identifier.
pub type ConnectionId = u64;

/// Outgoing message channel of one connection.
pub type Outbox = mpsc::Sender<ServerMessage>;

struct ConnectionEntry {
    user_id: Option<UserId>,
    outbox: Outbox,
}

#[derive(Default)]
struct PresenceTables {
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
    rooms: BTreeMap<RoomId, BTreeMap<ConnectionId, UserId>>,
}

impl PresenceTables {
    fn outboxes(&self, ids: impl Iterator<Item = ConnectionId>) -> Vec<Outbox> {
        ids.filter_map(|id| self.connections.get(&id).map(|c| c.outbox.clone()))
            .collect()
    }
}

/// Queue a fan-out message without waiting. A connection whose outbox is
/// full misses the message; a closed outbox is skipped.
pub fn deliver(outbox: &Outbox, msg: ServerMessage) -> bool {
    match outbox.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("outbox full, dropping fan-out message");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Shared presence registry.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<PresenceTables>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbox.
    pub async fn connect(&self, id: ConnectionId, user_id: Option<UserId>, outbox: Outbox) {
        let mut tables = self.inner.write().await;
        tables
            .connections
            .insert(id, ConnectionEntry { user_id, outbox });
    }

    /// Record the identity of an already registered connection.
    pub async fn set_identity(&self, id: ConnectionId, user_id: UserId) {
        let mut tables = self.inner.write().await;
        if let Some(entry) = tables.connections.get_mut(&id) {
            entry.user_id = Some(user_id);
        }
    }

    /// Identity attached to a connection, if any.
    pub async fn identity(&self, id: ConnectionId) -> Option<UserId> {
        let tables = self.inner.read().await;
        tables.connections.get(&id).and_then(|c| c.user_id)
    }

    /// Remove a connection and every room entry it held.
    /// Returns the rooms it was present in.
    pub async fn disconnect(&self, id: ConnectionId) -> Vec<(RoomId, UserId)> {
        let mut tables = self.inner.write().await;
        tables.connections.remove(&id);

        let mut left = Vec::new();
        tables.rooms.retain(|room_id, members| {
            if let Some(user_id) = members.remove(&id) {
                left.push((*room_id, user_id));
            }
            !members.is_empty()
        });
        left
    }

    /// Add a connection to a room. Returns false if it was already there.
    pub async fn join(&self, room_id: RoomId, id: ConnectionId, user_id: UserId) -> bool {
        let mut tables = self.inner.write().await;
        let joined = tables
            .rooms
            .entry(room_id)
            .or_default()
            .insert(id, user_id)
            .is_none();
        debug!(%room_id, connection = id, %user_id, joined, "room join");
        joined
    }

    /// Remove a connection from a room.
    pub async fn leave(&self, room_id: RoomId, id: ConnectionId) -> Option<UserId> {
        let mut tables = self.inner.write().await;
        let members = tables.rooms.get_mut(&room_id)?;
        let user_id = members.remove(&id);
        if members.is_empty() {
            tables.rooms.remove(&room_id);
        }
        user_id
    }

    /// Remove every connection of `user_id` from a room. Returns the outboxes
    /// of the removed connections.
    pub async fn remove_user(&self, room_id: RoomId, user_id: UserId) -> Vec<Outbox> {
        let mut tables = self.inner.write().await;
        let Some(members) = tables.rooms.get_mut(&room_id) else {
            return Vec::new();
        };

        let removed: Vec<ConnectionId> = members
            .iter()
            .filter(|(_, member)| **member == user_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &removed {
            members.remove(id);
        }
        if members.is_empty() {
            tables.rooms.remove(&room_id);
        }
        tables.outboxes(removed.into_iter())
    }

    /// Distinct users present in a room.
    pub async fn online(&self, room_id: RoomId) -> Vec<UserId> {
        let tables = self.inner.read().await;
        tables
            .rooms
            .get(&room_id)
            .map(|members| {
                members
                    .values()
                    .copied()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a connection is present in a room.
    pub async fn is_present(&self, room_id: RoomId, id: ConnectionId) -> bool {
        let tables = self.inner.read().await;
        tables
            .rooms
            .get(&room_id)
            .is_some_and(|members| members.contains_key(&id))
    }

    /// Send a message to every connection in a room without waiting on any
    /// of them. Returns how many connections accepted it.
    pub async fn broadcast(&self, room_id: RoomId, msg: ServerMessage) -> usize {
        let outboxes = {
            let tables = self.inner.read().await;
            match tables.rooms.get(&room_id) {
                Some(members) => tables.outboxes(members.keys().copied()),
                None => return 0,
            }
        };

        outboxes
            .iter()
            .filter(|outbox| deliver(outbox, msg.clone()))
            .count()
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}
