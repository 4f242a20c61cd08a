// src/hub.rs

//! Room-based pub/sub between the server and connected sessions.
//!
//! Each session gets a bounded outbound queue drained by its WebSocket task.
//! Sends never wait: a session whose queue is full misses that message, so a
//! slow tab cannot hold up delivery to the others.

use crate::event::ServerMessage;
use crate::room::Room;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Identifier of one connected session.
pub type SessionId = u64;

/// Default per-session queue length.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
struct SessionSlot {
    tx: mpsc::Sender<ServerMessage>,
    rooms: HashSet<Room>,
}

/// Registry of sessions and their room memberships.
#[derive(Debug)]
pub struct RoomHub {
    next_id: AtomicU64,
    capacity: usize,
    sessions: DashMap<SessionId, SessionSlot>,
    rooms: DashMap<Room, HashSet<SessionId>>,
}

impl Default for RoomHub {
    fn default() -> Self {
        RoomHub::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        RoomHub {
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            sessions: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Adds a session with no rooms and returns the receiving end of its queue.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions.insert(
            id,
            SessionSlot {
                tx,
                rooms: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Subscribes `id` to `room`. Returns `false` if it was already a member
    /// or the session is gone.
    pub fn join(&self, id: SessionId, room: Room) -> bool {
        let added = match self.sessions.get_mut(&id) {
            Some(mut slot) => slot.rooms.insert(room.clone()),
            None => return false,
        };
        if added {
            self.rooms.entry(room).or_default().insert(id);
        }
        added
    }

    /// Rooms `id` is subscribed to, sorted.
    pub fn rooms_of(&self, id: SessionId) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .sessions
            .get(&id)
            .map(|slot| slot.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Number of sessions subscribed to `room`.
    pub fn members(&self, room: &Room) -> usize {
        self.rooms.get(room).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queues `msg` for one session.
    pub fn send_to(&self, id: SessionId, msg: ServerMessage) -> bool {
        let tx = match self.sessions.get(&id) {
            Some(slot) => slot.tx.clone(),
            None => return false,
        };
        offer(id, &tx, msg)
    }

    /// Queues `msg` for every member of `room`; returns how many accepted it.
    pub fn emit_to_room(&self, room: &Room, msg: &ServerMessage) -> usize {
        let ids: Vec<SessionId> = match self.rooms.get(room) {
            Some(ids) => ids.iter().copied().collect(),
            None => return 0,
        };
        ids.into_iter()
            .filter(|id| self.send_to(*id, msg.clone()))
            .count()
    }

    /// Queues `msg` for every connected session.
    pub fn broadcast(&self, msg: &ServerMessage) -> usize {
        let targets: Vec<(SessionId, mpsc::Sender<ServerMessage>)> = self
            .sessions
            .iter()
            .map(|slot| (*slot.key(), slot.tx.clone()))
            .collect();
        targets
            .into_iter()
            .filter(|(id, tx)| offer(*id, tx, msg.clone()))
            .count()
    }

    /// Drops a session and all its memberships. Rooms left without members
    /// disappear.
    pub fn unregister(&self, id: SessionId) {
        let Some((_, slot)) = self.sessions.remove(&id) else {
            return;
        };
        for room in slot.rooms {
            if let Some(mut ids) = self.rooms.get_mut(&room) {
                ids.remove(&id);
            }
            self.rooms.remove_if(&room, |_, ids| ids.is_empty());
        }
    }
}

fn offer(id: SessionId, tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!("Session {} is lagging, dropped {}", id, msg.name());
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Session {} queue closed", id);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UpdatePayload;

    fn css(room: &str) -> ServerMessage {
        ServerMessage::CssUpdate(UpdatePayload {
            file_name: Room::new(room).unwrap(),
            contents: None,
        })
    }

    #[test]
    fn join_is_idempotent() {
        let hub = RoomHub::default();
        let (id, _rx) = hub.register();
        let room = Room::new("index.html").unwrap();
        assert!(hub.join(id, room.clone()));
        assert!(!hub.join(id, room.clone()));
        assert_eq!(hub.members(&room), 1);
        assert_eq!(hub.rooms_of(id), vec![room]);
    }

    #[test]
    fn emits_only_to_room_members() {
        let hub = RoomHub::default();
        let (a, mut rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        hub.join(a, Room::new("a.css").unwrap());
        hub.join(b, Room::new("b.css").unwrap());

        let delivered = hub.emit_to_room(&Room::new("b.css").unwrap(), &css("b.css"));
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), css("b.css"));
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let hub = RoomHub::default();
        let (_a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        let msg = ServerMessage::ReloadSelf { self_version: 3 };
        assert_eq!(hub.broadcast(&msg), 2);
        assert_eq!(rx_a.try_recv().unwrap(), msg);
        assert_eq!(rx_b.try_recv().unwrap(), msg);
    }

    #[test]
    fn full_queue_does_not_block_others() {
        let hub = RoomHub::new(1);
        let (slow, _rx_slow) = hub.register();
        let (fast, mut rx_fast) = hub.register();
        let room = Room::new("styles.css").unwrap();
        hub.join(slow, room.clone());
        hub.join(fast, room.clone());

        assert_eq!(hub.emit_to_room(&room, &css("styles.css")), 2);
        rx_fast.try_recv().unwrap();
        // The slow session never drained; only the fast one accepts.
        assert_eq!(hub.emit_to_room(&room, &css("styles.css")), 1);
    }

    #[test]
    fn unregister_discards_memberships() {
        let hub = RoomHub::default();
        let (id, _rx) = hub.register();
        let room = Room::new("index.html").unwrap();
        hub.join(id, room.clone());
        hub.unregister(id);
        assert_eq!(hub.members(&room), 0);
        assert_eq!(hub.session_count(), 0);
        assert!(!hub.join(id, room));
    }
}
