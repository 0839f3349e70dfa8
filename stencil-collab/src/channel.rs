//! Pub/sub channel abstraction and the in-process hub.
//!
//! A [`Channel`] is one participant's handle on one session: it carries
//! protocol messages both ways and exposes the session's presence map.
//! [`LocalHub`] implements it in-process on top of [`BroadcastGroup`];
//! [`WsChannelFactory`](crate::client::WsChannelFactory) implements it
//! against a [`RelayServer`](crate::server::RelayServer).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, RoomFrame, RoomManager};
use crate::protocol::{PresenceMeta, ProtocolError, SyncMessage};

/// Default per-subscriber buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Realtime backend unavailable: {0}")]
    Unavailable(String),
    #[error("Channel closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Inbound channel traffic. Messages sent by the subscriber itself are
/// never delivered back to it.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(SyncMessage),
    PresenceJoin(PresenceMeta),
    PresenceLeave(Uuid),
    /// Membership may have changed wholesale; re-read `presence_state`.
    PresenceSync,
    /// The backend dropped this subscription.
    Closed,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn session_id(&self) -> Uuid;

    /// Start receiving. Can only be called once per channel.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError>;

    async fn send(&self, msg: &SyncMessage) -> Result<(), TransportError>;

    /// Publish this participant's presence.
    async fn track(&self, meta: &PresenceMeta) -> Result<(), TransportError>;

    async fn untrack(&self) -> Result<(), TransportError>;

    /// Everyone currently present, this participant included.
    async fn presence_state(&self) -> Vec<PresenceMeta>;

    async fn unsubscribe(&mut self);
}

#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Box<dyn Channel>, TransportError>;
}

// ─── In-process hub ──────────────────────────────────────────────────

struct HubInner {
    rooms: RoomManager,
    available: AtomicBool,
}

/// In-process realtime backend. Cloning shares the same rooms.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: RoomManager::new(capacity),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the backend going down (`false`) or coming back.
    /// Existing subscriptions are unaffected; see [`sever`](Self::sever).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Drop every subscription to a session, as a lost connection would.
    pub async fn sever(&self, session_id: Uuid) -> bool {
        match self.inner.rooms.remove(&session_id).await {
            Some(room) => {
                log::info!("Severing session {session_id}");
                room.sever().await;
                true
            }
            None => false,
        }
    }

    pub async fn presence(&self, session_id: Uuid) -> Vec<PresenceMeta> {
        match self.inner.rooms.get(&session_id).await {
            Some(room) => room.presence().await,
            None => Vec::new(),
        }
    }

    pub async fn stats(&self, session_id: Uuid) -> Option<BroadcastStats> {
        match self.inner.rooms.get(&session_id).await {
            Some(room) => Some(room.stats().await),
            None => None,
        }
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(TransportError::Unavailable("local hub offline".into()))
        }
    }
}

#[async_trait]
impl ChannelFactory for LocalHub {
    async fn open(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Box<dyn Channel>, TransportError> {
        self.check_available()?;
        let room = self.inner.rooms.get_or_create(session_id).await;
        Ok(Box::new(LocalChannel {
            hub: self.clone(),
            session_id,
            participant_id,
            room,
            forward: None,
        }))
    }
}

/// One participant's subscription to a [`LocalHub`] room.
pub struct LocalChannel {
    hub: LocalHub,
    session_id: Uuid,
    participant_id: Uuid,
    room: Arc<BroadcastGroup>,
    forward: Option<JoinHandle<()>>,
}

impl LocalChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        match &self.forward {
            Some(handle) if !handle.is_finished() => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError> {
        self.hub.check_available()?;
        if self.forward.is_some() {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.room.capacity().max(1));
        let mut frames = self.room.subscribe();
        let room = self.room.clone();
        let me = self.participant_id;

        // Initial membership snapshot.
        let _ = tx.send(ChannelEvent::PresenceSync).await;

        self.forward = Some(tokio::spawn(async move {
            loop {
                let event = match frames.recv().await {
                    Ok(RoomFrame::Message { from, .. }) if from == me => continue,
                    Ok(RoomFrame::Message { bytes, .. }) => match SyncMessage::decode(&bytes) {
                        Ok(msg) => ChannelEvent::Message(msg),
                        Err(e) => {
                            log::warn!("Dropping undecodable frame: {e}");
                            continue;
                        }
                    },
                    Ok(RoomFrame::Join(meta)) => ChannelEvent::PresenceJoin(meta),
                    Ok(RoomFrame::Leave(id)) => ChannelEvent::PresenceLeave(id),
                    Ok(RoomFrame::Severed) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx.send(ChannelEvent::Closed).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber {me} lagged, {n} frames dropped");
                        room.record_dropped(n);
                        continue;
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }));

        Ok(rx)
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.room.broadcast(self.participant_id, msg)?;
        Ok(())
    }

    async fn track(&self, meta: &PresenceMeta) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.room.track(meta.clone()).await;
        Ok(())
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        self.room.untrack(&self.participant_id).await;
        Ok(())
    }

    async fn presence_state(&self) -> Vec<PresenceMeta> {
        self.room.presence().await
    }

    async fn unsubscribe(&mut self) {
        if let Some(handle) = self.forward.take() {
            handle.abort();
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.forward.take() {
            handle.abort();
        }
    }
}
