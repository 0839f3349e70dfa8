//! Per-session fan-out with presence tracking.
//!
//! Every session gets one tokio broadcast channel. Subscribers receive all
//! frames, their own included; filtering is the subscriber's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PresenceMeta, ProtocolError, SyncMessage};

/// What travels through a session room.
#[derive(Debug, Clone)]
pub enum RoomFrame {
    /// Encoded [`SyncMessage`] and its sender.
    Message { from: Uuid, bytes: Arc<Vec<u8>> },
    Join(PresenceMeta),
    Leave(Uuid),
    /// The room was torn down underneath its subscribers.
    Severed,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub present: usize,
    pub subscribers: usize,
}

/// A broadcast group for a single session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    presence: RwLock<HashMap<Uuid, PresenceMeta>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow subscriber may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            presence: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.sender.subscribe()
    }

    /// Encode and fan out. Returns the number of receivers reached.
    pub fn broadcast(&self, from: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(from, bytes))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(RoomFrame::Message { from, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging subscriber never saw.
    pub fn record_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Add or replace a participant's presence and announce it.
    pub async fn track(&self, meta: PresenceMeta) {
        self.presence
            .write()
            .await
            .insert(meta.participant_id, meta.clone());
        let _ = self.sender.send(RoomFrame::Join(meta));
    }

    /// Remove a participant's presence, announcing it if it was there.
    pub async fn untrack(&self, participant_id: &Uuid) -> Option<PresenceMeta> {
        let removed = self.presence.write().await.remove(participant_id);
        if removed.is_some() {
            let _ = self.sender.send(RoomFrame::Leave(*participant_id));
        }
        removed
    }

    /// Current membership, ordered by participant id.
    pub async fn presence(&self) -> Vec<PresenceMeta> {
        let mut members: Vec<PresenceMeta> = self.presence.read().await.values().cloned().collect();
        members.sort_by_key(|m| m.participant_id);
        members
    }

    pub async fn is_present(&self, participant_id: &Uuid) -> bool {
        self.presence.read().await.contains_key(participant_id)
    }

    pub async fn present_count(&self) -> usize {
        self.presence.read().await.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Drop all presence and tell every subscriber the room is gone.
    pub async fn sever(&self) {
        self.presence.write().await.clear();
        let _ = self.sender.send(RoomFrame::Severed);
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            present: self.present_count().await,
            subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps session ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, session_id: Uuid) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&session_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&session_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(session_id, room.clone());
        room
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.write().await.remove(session_id)
    }

    /// Remove a room nobody is present in or listening to.
    pub async fn remove_if_empty(&self, session_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session_id) {
            if room.present_count().await == 0 && room.subscriber_count() == 0 {
                rooms.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
