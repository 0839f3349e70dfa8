//! Bridges a [`SharedDocument`] to a session channel.
//!
//! ```text
//!  local edit ──► SharedDocument ──► Delta(Local) ──► channel ──► peers
//!                      ▲
//!  channel ──► Delta ──┘ apply_remote (Remote, never re-sent)
//!  channel ──► SyncStep1 ──► host answers SyncStep2 { diff, state vector }
//!  channel ──► SyncStep2 ──► apply_snapshot (Init) ──► send back what
//!                                                     the responder lacks
//! ```
//!
//! The transport owns its document. Offline edits are not queued: the
//! resync performed on every (re)connect exchanges full state instead.

use std::sync::Arc;
use std::time::Duration;

use stencil_core::{Delta, DocumentError, SharedDocument};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::{Channel, ChannelEvent, ChannelFactory, TransportError};
use crate::protocol::{
    AwarenessState, MessageType, PresenceMeta, ProtocolError, ResyncPayload, SyncMessage,
};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How often callers should [`ping`](SyncTransport::ping).
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the application needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The channel dropped. The document stays editable locally.
    Disconnected,
    /// A peer's delta changed the document.
    RemoteDelta { participant_id: Uuid },
    /// A resync answer was integrated.
    StateSynced { from: Uuid },
    RemoteAwareness(AwarenessState),
    /// Presence membership, rebuilt in full.
    PresenceChanged(Vec<PresenceMeta>),
}

pub struct SyncTransport {
    factory: Arc<dyn ChannelFactory>,
    session_id: Uuid,
    local: PresenceMeta,
    host_id: Uuid,
    config: TransportConfig,
    document: SharedDocument,
    channel: Option<Box<dyn Channel>>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    state: ConnectionState,
    presence: Vec<PresenceMeta>,
    last_activity: Instant,
}

impl SyncTransport {
    /// `host_id` is passed in explicitly; the transport never looks it up.
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        session_id: Uuid,
        local: PresenceMeta,
        host_id: Uuid,
        config: TransportConfig,
    ) -> Self {
        Self::with_document(factory, session_id, local, host_id, config, SharedDocument::new())
    }

    pub fn with_document(
        factory: Arc<dyn ChannelFactory>,
        session_id: Uuid,
        local: PresenceMeta,
        host_id: Uuid,
        config: TransportConfig,
        document: SharedDocument,
    ) -> Self {
        Self {
            factory,
            session_id,
            local,
            host_id,
            config,
            document,
            channel: None,
            events: None,
            state: ConnectionState::Disconnected,
            presence: Vec::new(),
            last_activity: Instant::now(),
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Open the session channel, publish presence and request a resync.
    ///
    /// On failure the transport stays disconnected and the document keeps
    /// working locally.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.state = ConnectionState::Connecting;
        match self.open_channel().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.last_activity = Instant::now();
                log::info!(
                    "Participant {} connected to session {}",
                    self.local.participant_id,
                    self.session_id
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("Session {} running local-only: {e}", self.session_id);
                self.teardown().await;
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_channel(&mut self) -> Result<(), TransportError> {
        let mut channel = self
            .factory
            .open(self.session_id, self.local.participant_id)
            .await?;
        let events = channel.subscribe().await?;
        channel.track(&self.local).await?;
        channel
            .send(&SyncMessage::sync_step1(
                self.local.participant_id,
                self.session_id,
                self.document.state_vector(),
            ))
            .await?;

        self.presence = channel.presence_state().await;
        self.channel = Some(channel);
        self.events = Some(events);
        Ok(())
    }

    /// Drop the current channel (if any) and connect again. Always ends in
    /// a full-state resync.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.teardown().await;
        self.state = ConnectionState::Reconnecting;
        self.connect().await
    }

    async fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.untrack().await;
            channel.unsubscribe().await;
        }
        self.events = None;
        self.presence.clear();
    }

    /// Leave the channel and drop the document.
    pub async fn disconnect(mut self) {
        self.teardown().await;
        log::info!(
            "Participant {} left session {}",
            self.local.participant_id,
            self.session_id
        );
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    /// Broadcast a delta. Returns whether it was sent.
    ///
    /// Only `Local` deltas are sent. Nothing is queued while offline.
    pub async fn publish(&self, delta: &Delta) -> Result<bool, TransportError> {
        if !delta.is_broadcastable() {
            log::trace!("Not broadcasting {:?} delta", delta.origin);
            return Ok(false);
        }
        let Some(channel) = self.connected_channel() else {
            log::debug!("Offline, delta will travel with the next resync");
            return Ok(false);
        };
        channel
            .send(&SyncMessage::delta(
                self.local.participant_id,
                self.session_id,
                delta.update.clone(),
            ))
            .await?;
        Ok(true)
    }

    /// Mutate the document and publish the result. Send failures are
    /// logged; the edit itself always stands.
    pub async fn edit<F>(&mut self, f: F) -> Delta
    where
        F: FnOnce(&mut SharedDocument) -> Delta,
    {
        let delta = f(&mut self.document);
        if let Err(e) = self.publish(&delta).await {
            log::warn!("Failed to publish delta: {e}");
        }
        delta
    }

    /// [`edit`](Self::edit) for fallible mutations.
    pub async fn try_edit<F>(&mut self, f: F) -> Result<Delta, DocumentError>
    where
        F: FnOnce(&mut SharedDocument) -> Result<Delta, DocumentError>,
    {
        let delta = f(&mut self.document)?;
        if let Err(e) = self.publish(&delta).await {
            log::warn!("Failed to publish delta: {e}");
        }
        Ok(delta)
    }

    /// Awareness is dropped silently while offline.
    pub async fn broadcast_awareness(&self, state: &AwarenessState) -> Result<(), TransportError> {
        let Some(channel) = self.connected_channel() else {
            return Ok(());
        };
        channel
            .send(&SyncMessage::awareness(self.session_id, state)?)
            .await
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        let channel = self.connected_channel().ok_or(TransportError::Closed)?;
        channel.send(&SyncMessage::ping(self.local.participant_id)).await
    }

    fn connected_channel(&self) -> Option<&dyn Channel> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.channel.as_deref()
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    /// Wait for the next event worth surfacing. Returns `None` when there
    /// is no channel to listen on.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let events = self.events.as_mut()?;
            let event = match events.recv().await {
                Some(ChannelEvent::Closed) | None => {
                    log::warn!("Session {} channel closed", self.session_id);
                    self.teardown().await;
                    self.state = ConnectionState::Disconnected;
                    return Some(TransportEvent::Disconnected);
                }
                Some(event) => event,
            };
            self.last_activity = Instant::now();

            let surfaced = match event {
                ChannelEvent::Message(msg) => self.handle_message(msg).await,
                ChannelEvent::PresenceJoin(_)
                | ChannelEvent::PresenceLeave(_)
                | ChannelEvent::PresenceSync => self.rebuild_presence().await,
                ChannelEvent::Closed => None,
            };
            if surfaced.is_some() {
                return surfaced;
            }
        }
    }

    async fn handle_message(&mut self, msg: SyncMessage) -> Option<TransportEvent> {
        match msg.msg_type {
            MessageType::Delta => match self.document.apply_remote(&msg.payload) {
                Ok(_) => Some(TransportEvent::RemoteDelta {
                    participant_id: msg.participant_id,
                }),
                Err(DocumentError::MergeNoop) => {
                    log::debug!("Delta from {} already applied", msg.participant_id);
                    None
                }
                Err(e) => {
                    log::warn!("Ignoring delta from {}: {e}", msg.participant_id);
                    None
                }
            },
            MessageType::SyncStep1 => {
                if self.should_answer(msg.participant_id) {
                    if let Err(e) = self.answer_resync(&msg).await {
                        log::warn!("Failed to answer resync from {}: {e}", msg.participant_id);
                    }
                }
                None
            }
            MessageType::SyncStep2 => self.integrate_resync(&msg).await,
            MessageType::Awareness => match msg.awareness_state() {
                Ok(state) => {
                    log::trace!("Awareness from {}", msg.participant_id);
                    Some(TransportEvent::RemoteAwareness(state))
                }
                Err(e) => {
                    log::warn!("Ignoring awareness from {}: {e}", msg.participant_id);
                    None
                }
            },
            MessageType::PresenceSync => self.rebuild_presence().await,
            _ => None,
        }
    }

    /// The host answers resync requests. A guest answers only when there
    /// is no other host to do it.
    fn should_answer(&self, requester: Uuid) -> bool {
        if self.is_host() || requester == self.host_id {
            return true;
        }
        !self.host_present()
    }

    async fn answer_resync(&self, request: &SyncMessage) -> Result<(), TransportError> {
        let update = self
            .document
            .encode_diff(&request.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let resync = ResyncPayload {
            target: request.participant_id,
            update,
            state_vector: self.document.state_vector(),
        };
        let channel = self.connected_channel().ok_or(TransportError::Closed)?;
        channel
            .send(&SyncMessage::sync_step2(
                self.local.participant_id,
                self.session_id,
                &resync,
            )?)
            .await?;
        log::debug!("Answered resync from {}", request.participant_id);
        Ok(())
    }

    async fn integrate_resync(&mut self, msg: &SyncMessage) -> Option<TransportEvent> {
        let resync = match msg.resync() {
            Ok(resync) => resync,
            Err(e) => {
                log::warn!("Ignoring resync from {}: {e}", msg.participant_id);
                return None;
            }
        };
        if resync.target != self.local.participant_id {
            return None;
        }

        match self.document.apply_snapshot(&resync.update) {
            Ok(_) | Err(DocumentError::MergeNoop) => {}
            Err(e) => {
                log::warn!("Ignoring resync from {}: {e}", msg.participant_id);
                return None;
            }
        }

        // Whatever the responder is missing goes out once as a delta.
        match self.document.encode_diff(&resync.state_vector) {
            Ok(missing) if !SharedDocument::is_empty_update(&missing) => {
                if let Some(channel) = self.connected_channel() {
                    let back = SyncMessage::delta(self.local.participant_id, self.session_id, missing);
                    if let Err(e) = channel.send(&back).await {
                        log::warn!("Failed to send resync back-fill: {e}");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Bad state vector from {}: {e}", msg.participant_id),
        }

        log::info!("Resynced session {} from {}", self.session_id, msg.participant_id);
        Some(TransportEvent::StateSynced {
            from: msg.participant_id,
        })
    }

    async fn rebuild_presence(&mut self) -> Option<TransportEvent> {
        let channel = self.channel.as_ref()?;
        self.presence = channel.presence_state().await;
        Some(TransportEvent::PresenceChanged(self.presence.clone()))
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    pub fn local(&self) -> &PresenceMeta {
        &self.local
    }

    pub fn is_host(&self) -> bool {
        self.local.participant_id == self.host_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn presence(&self) -> &[PresenceMeta] {
        &self.presence
    }

    pub fn host_present(&self) -> bool {
        self.presence.iter().any(|p| p.participant_id == self.host_id)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Nothing heard for longer than the heartbeat timeout.
    pub fn is_stale(&self) -> bool {
        self.is_connected() && self.last_activity.elapsed() > self.config.heartbeat_timeout
    }
}
