//! Room membership and fan-out for the relay.
//!
//! Every socket owns a bounded outbox drained by its connection task. A
//! broadcast encodes the frame once and hands the same `Arc` to every
//! other member of the room.
//!
//! ```text
//!                 ┌──────────── RoomManager ────────────┐
//!  server-        │  rooms:   room_id → [socket_id]     │      outbox A ──► socket A
//!  broadcast ───► │  sockets: socket_id → outbox, rooms │ ───► outbox B ──► socket B
//!                 └─────────────────────────────────────┘      outbox C ──► socket C
//! ```
//!
//! Sends never wait. Volatile frames are dropped when a receiver's outbox
//! is full; a receiver that falls behind on reliable frames loses its
//! outbox and its connection task shuts down.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{Frame, ProtocolError, SocketId};
use crate::room::{is_follow_room, RoomId};

pub type Outbox = mpsc::Receiver<Arc<Vec<u8>>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sockets: usize,
    pub active_rooms: usize,
}

/// Counters updated without taking the table lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Result of joining a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Nobody else was in the room.
    pub first: bool,
    /// Members after the join, in join order.
    pub members: Vec<SocketId>,
}

struct SocketEntry {
    /// `None` once evicted; membership stays until the socket unregisters.
    outbox: Option<mpsc::Sender<Arc<Vec<u8>>>>,
    rooms: HashSet<RoomId>,
}

#[derive(Default)]
struct RoomTable {
    sockets: HashMap<SocketId, SocketEntry>,
    rooms: HashMap<RoomId, Vec<SocketId>>,
}

impl RoomTable {
    fn remove_member(&mut self, room_id: &str, socket_id: &str) -> Option<Vec<SocketId>> {
        let members = self.rooms.get_mut(room_id)?;
        let before = members.len();
        members.retain(|id| id != socket_id);
        if members.len() == before {
            return None;
        }
        let remaining = members.clone();
        if remaining.is_empty() {
            self.rooms.remove(room_id);
        }
        if let Some(entry) = self.sockets.get_mut(socket_id) {
            entry.rooms.remove(room_id);
        }
        Some(remaining)
    }
}

/// Socket registry and room routing table.
pub struct RoomManager {
    table: RwLock<RoomTable>,
    outbox_capacity: usize,
    stats: AtomicBroadcastStats,
}

impl RoomManager {
    /// `outbox_capacity` frames are buffered per socket.
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            table: RwLock::new(RoomTable::default()),
            outbox_capacity: outbox_capacity.max(1),
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a connected socket and return its outbox.
    pub async fn register(&self, socket_id: &str) -> Outbox {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let mut table = self.table.write().await;
        table.sockets.insert(
            socket_id.to_string(),
            SocketEntry {
                outbox: Some(tx),
                rooms: HashSet::new(),
            },
        );
        rx
    }

    /// Drop a socket from every room. Returns each room it was in with the
    /// members left behind.
    pub async fn unregister(&self, socket_id: &str) -> Vec<(RoomId, Vec<SocketId>)> {
        let mut table = self.table.write().await;
        let Some(entry) = table.sockets.remove(socket_id) else {
            return Vec::new();
        };
        let mut rooms: Vec<RoomId> = entry.rooms.into_iter().collect();
        rooms.sort();
        rooms
            .into_iter()
            .filter_map(|room_id| {
                let remaining = table.remove_member(&room_id, socket_id)?;
                Some((room_id, remaining))
            })
            .collect()
    }

    pub async fn join(&self, room_id: &str, socket_id: &str) -> JoinOutcome {
        let mut table = self.table.write().await;
        if let Some(entry) = table.sockets.get_mut(socket_id) {
            entry.rooms.insert(room_id.to_string());
        }
        let members = table.rooms.entry(room_id.to_string()).or_default();
        if !members.iter().any(|id| id == socket_id) {
            members.push(socket_id.to_string());
        }
        JoinOutcome {
            first: members.len() <= 1,
            members: members.clone(),
        }
    }

    /// Returns the remaining members, or `None` if the socket wasn't in the
    /// room.
    pub async fn leave(&self, room_id: &str, socket_id: &str) -> Option<Vec<SocketId>> {
        self.table.write().await.remove_member(room_id, socket_id)
    }

    pub async fn members(&self, room_id: &str) -> Vec<SocketId> {
        self.table
            .read()
            .await
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver one frame to one socket.
    pub async fn send_to(&self, socket_id: &str, frame: &Frame) -> Result<bool, ProtocolError> {
        let bytes = Arc::new(frame.encode()?);
        let outbox = {
            let table = self.table.read().await;
            table
                .sockets
                .get(socket_id)
                .and_then(|entry| entry.outbox.clone())
        };
        let Some(outbox) = outbox else {
            return Ok(false);
        };
        let delivered = self
            .deliver(vec![(socket_id.to_string(), outbox)], bytes, false)
            .await;
        Ok(delivered == 1)
    }

    /// Fan a frame out to every member of `room_id` except `from`.
    /// Returns the number of sockets it was queued for.
    pub async fn broadcast(&self, room_id: &str, from: Option<&str>, frame: &Frame, volatile: bool) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(frame.encode()?);
        Ok(self.broadcast_raw(room_id, from, bytes, volatile).await)
    }

    /// Fan out pre-encoded bytes.
    pub async fn broadcast_raw(&self, room_id: &str, from: Option<&str>, bytes: Arc<Vec<u8>>, volatile: bool) -> usize {
        let outboxes: Vec<(SocketId, mpsc::Sender<Arc<Vec<u8>>>)> = {
            let table = self.table.read().await;
            let Some(members) = table.rooms.get(room_id) else {
                return 0;
            };
            members
                .iter()
                .filter(|id| Some(id.as_str()) != from)
                .filter_map(|id| {
                    let entry = table.sockets.get(id)?;
                    Some((id.clone(), entry.outbox.clone()?))
                })
                .collect()
        };
        self.deliver(outboxes, bytes, volatile).await
    }

    async fn deliver(
        &self,
        outboxes: Vec<(SocketId, mpsc::Sender<Arc<Vec<u8>>>)>,
        bytes: Arc<Vec<u8>>,
        volatile: bool,
    ) -> usize {
        let mut delivered = 0;
        let mut lagging = Vec::new();
        for (socket_id, outbox) in outboxes {
            match outbox.try_send(bytes.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    if !volatile {
                        lagging.push(socket_id);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if !lagging.is_empty() {
            self.evict(&lagging).await;
        }
        delivered
    }

    /// Close the outboxes of sockets that can't keep up.
    async fn evict(&self, socket_ids: &[SocketId]) {
        let mut table = self.table.write().await;
        for socket_id in socket_ids {
            if let Some(entry) = table.sockets.get_mut(socket_id) {
                if entry.outbox.take().is_some() {
                    log::warn!("Socket {socket_id} fell behind, disconnecting");
                }
            }
        }
    }

    /// Collaboration rooms and their sizes. Follow rooms are internal.
    pub async fn room_sizes(&self) -> Vec<(RoomId, usize)> {
        let table = self.table.read().await;
        let mut rooms: Vec<(RoomId, usize)> = table
            .rooms
            .iter()
            .filter(|(room_id, _)| !is_follow_room(room_id))
            .map(|(room_id, members)| (room_id.clone(), members.len()))
            .collect();
        rooms.sort();
        rooms
    }

    pub async fn room_count(&self) -> usize {
        self.table.read().await.rooms.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let table = self.table.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sockets: table.sockets.len(),
            active_rooms: table.rooms.len(),
        }
    }
}
