//! WebSocket relay for collaboration sessions.
//!
//! Architecture:
//! ```text
//! Host  ──┐                                  ┌──► Host
//!          ├── Room (session_id) ── BroadcastGroup
//! Guest ──┘         │                        └──► Guest
//!                   └── presence map (PresenceMeta per participant)
//! ```
//!
//! The relay holds no document state. It fans out opaque protocol frames
//! between the participants of a session and keeps the presence map. A
//! connection starts with `Subscribe`; `PeerJoined` / `PeerLeft` track and
//! untrack presence, `Ping` is answered with `Pong`, and anything else is
//! relayed to the rest of the room.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomFrame, RoomManager};
use crate::channel::DEFAULT_CHANNEL_CAPACITY;
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections allowed per session room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 8,
            broadcast_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Shared per-server state handed to every connection task.
struct Relay {
    config: RelayConfig,
    rooms: RoomManager,
    counters: Counters,
}

pub struct RelayServer {
    relay: Arc<Relay>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            relay: Arc::new(Relay {
                config,
                rooms,
                counters: Counters::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.relay.config
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.relay.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.relay.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, &relay).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                relay.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Drop every connection to a session. Their clients see the channel
    /// close.
    pub async fn sever(&self, session_id: Uuid) -> bool {
        match self.relay.rooms.remove(&session_id).await {
            Some(room) => {
                log::info!("Severing session {session_id}");
                room.sever().await;
                true
            }
            None => false,
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let c = &self.relay.counters;
        RelayStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
            total_bytes: c.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.relay.rooms.room_count().await,
        }
    }
}

/// What a connection has joined so far.
struct Membership {
    participant_id: Uuid,
    session_id: Uuid,
    room: Arc<BroadcastGroup>,
    frames: broadcast::Receiver<RoomFrame>,
    tracked: bool,
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, relay: &Relay) -> Result<(), BoxError> {
    relay.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    relay.counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let mut member: Option<Membership> = None;

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };

                    relay.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                    relay.counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                    let msg = match SyncMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };

                    match msg.msg_type {
                        MessageType::Subscribe => {
                            if member.is_some() {
                                log::debug!("Duplicate subscribe from {addr}");
                                continue;
                            }
                            let room = relay.rooms.get_or_create(msg.session_id).await;
                            if room.subscriber_count() >= relay.config.max_peers_per_room {
                                log::warn!("Session {} full, refusing {addr}", msg.session_id);
                                ws_sender.send(Message::Close(None)).await?;
                                return Ok(());
                            }
                            let frames = room.subscribe();
                            let members = room.presence().await;
                            let sync = SyncMessage::presence_sync(msg.session_id, &members)?;
                            ws_sender.send(Message::Binary(sync.encode()?.into())).await?;
                            log::info!(
                                "Participant {} subscribed to session {}",
                                msg.participant_id,
                                msg.session_id
                            );
                            member = Some(Membership {
                                participant_id: msg.participant_id,
                                session_id: msg.session_id,
                                room,
                                frames,
                                tracked: false,
                            });
                        }
                        _ if member.is_none() => {
                            if msg.msg_type == MessageType::Ping {
                                let pong = SyncMessage::pong(msg.participant_id);
                                ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                            } else {
                                log::debug!("{:?} from {addr} before subscribe", msg.msg_type);
                            }
                        }
                        MessageType::PeerJoined => {
                            if let Some(m) = member.as_mut() {
                                match msg.presence_meta() {
                                    Ok(meta) if meta.participant_id == m.participant_id => {
                                        log::info!("Presence: {} joined session {}", meta.name, m.session_id);
                                        m.room.track(meta).await;
                                        m.tracked = true;
                                    }
                                    Ok(meta) => log::warn!(
                                        "{addr} tried to track {} as {}",
                                        meta.participant_id,
                                        m.participant_id
                                    ),
                                    Err(e) => log::warn!("Bad presence from {addr}: {e}"),
                                }
                            }
                        }
                        MessageType::PeerLeft => {
                            if let Some(m) = member.as_mut() {
                                m.room.untrack(&m.participant_id).await;
                                m.tracked = false;
                            }
                        }
                        MessageType::Ping => {
                            let pong = SyncMessage::pong(msg.participant_id);
                            ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                        }
                        _ => {
                            if let Some(m) = member.as_ref() {
                                log::trace!("Relaying {:?} in session {}", msg.msg_type, m.session_id);
                                m.room.broadcast_raw(m.participant_id, Arc::new(data.to_vec()));
                            }
                        }
                    }
                }

                frame = async {
                    match member.as_mut() {
                        Some(m) => Some(m.frames.recv().await),
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(m) = member.as_ref() else { continue };
                    let outbound = match frame {
                        Some(Ok(RoomFrame::Message { from, .. })) if from == m.participant_id => continue,
                        Some(Ok(RoomFrame::Message { bytes, .. })) => bytes.to_vec(),
                        Some(Ok(RoomFrame::Join(meta))) => SyncMessage::peer_joined(m.session_id, &meta)?.encode()?,
                        Some(Ok(RoomFrame::Leave(id))) => SyncMessage::peer_left(id, m.session_id).encode()?,
                        Some(Ok(RoomFrame::Severed)) | Some(Err(broadcast::error::RecvError::Closed)) | None => {
                            log::info!("Session {} severed, closing {addr}", m.session_id);
                            ws_sender.send(Message::Close(None)).await?;
                            return Ok(());
                        }
                        Some(Err(broadcast::error::RecvError::Lagged(n))) => {
                            log::warn!("Participant {} lagged by {n} frames", m.participant_id);
                            m.room.record_dropped(n);
                            continue;
                        }
                    };
                    ws_sender.send(Message::Binary(outbound.into())).await?;
                }
            }
        }
    }
    .await;

    if let Some(m) = member {
        if m.tracked {
            m.room.untrack(&m.participant_id).await;
        }
        drop(m.frames);
        if relay.rooms.remove_if_empty(&m.session_id).await {
            log::debug!("Session room {} closed", m.session_id);
        }
        log::info!("Participant {} left session {}", m.participant_id, m.session_id);
    }

    result
}
