//! [`Channel`] over a WebSocket connection to a [`RelayServer`](crate::server::RelayServer).
//!
//! Each channel owns one socket with a writer task fed from an mpsc queue
//! and, once subscribed, a reader task that turns relay frames into
//! [`ChannelEvent`]s. The presence map is mirrored locally from
//! `PresenceSync` / `PeerJoined` / `PeerLeft` frames.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::channel::{Channel, ChannelEvent, ChannelFactory, TransportError, DEFAULT_CHANNEL_CAPACITY};
use crate::protocol::{MessageType, PresenceMeta, SyncMessage};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type PresenceCache = Arc<RwLock<HashMap<Uuid, PresenceMeta>>>;

/// Opens [`WsChannel`]s against a relay URL such as `ws://127.0.0.1:9090`.
#[derive(Debug, Clone)]
pub struct WsChannelFactory {
    url: String,
    capacity: usize,
}

impl WsChannelFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn open(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.capacity);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        log::debug!("Opened relay connection to {} for session {session_id}", self.url);
        Ok(Box::new(WsChannel {
            session_id,
            participant_id,
            capacity: self.capacity,
            outgoing: Some(out_tx),
            reader: Some(ws_reader),
            writer: Some(writer),
            forward: None,
            presence: Arc::new(RwLock::new(HashMap::new())),
        }))
    }
}

pub struct WsChannel {
    session_id: Uuid,
    participant_id: Uuid,
    capacity: usize,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    reader: Option<WsReader>,
    writer: Option<JoinHandle<()>>,
    forward: Option<JoinHandle<()>>,
    presence: PresenceCache,
}

impl WsChannel {
    async fn send_raw(&self, msg: &SyncMessage) -> Result<(), TransportError> {
        match &self.forward {
            Some(handle) if !handle.is_finished() => {}
            _ => return Err(TransportError::Closed),
        }
        let tx = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        tx.send(msg.encode()?).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError> {
        let mut ws_reader = self.reader.take().ok_or(TransportError::Closed)?;
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        outgoing
            .send(SyncMessage::subscribe(self.participant_id, self.session_id).encode()?)
            .await
            .map_err(|_| TransportError::Closed)?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let presence = self.presence.clone();
        let me = self.participant_id;

        self.forward = Some(tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let data = match frame {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg = match SyncMessage::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Dropping undecodable relay frame: {e}");
                        continue;
                    }
                };
                let event = match msg.msg_type {
                    MessageType::PresenceSync => match msg.presence_members() {
                        Ok(members) => {
                            let mut cache = presence.write().await;
                            cache.clear();
                            cache.extend(members.into_iter().map(|m| (m.participant_id, m)));
                            ChannelEvent::PresenceSync
                        }
                        Err(e) => {
                            log::warn!("Bad presence sync: {e}");
                            continue;
                        }
                    },
                    MessageType::PeerJoined => match msg.presence_meta() {
                        Ok(meta) => {
                            presence.write().await.insert(meta.participant_id, meta.clone());
                            ChannelEvent::PresenceJoin(meta)
                        }
                        Err(e) => {
                            log::warn!("Bad presence join: {e}");
                            continue;
                        }
                    },
                    MessageType::PeerLeft => {
                        presence.write().await.remove(&msg.participant_id);
                        ChannelEvent::PresenceLeave(msg.participant_id)
                    }
                    _ if msg.participant_id == me && msg.msg_type != MessageType::Pong => continue,
                    _ => ChannelEvent::Message(msg),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            presence.write().await.clear();
            let _ = tx.send(ChannelEvent::Closed).await;
        }));

        Ok(rx)
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), TransportError> {
        self.send_raw(msg).await
    }

    async fn track(&self, meta: &PresenceMeta) -> Result<(), TransportError> {
        self.send_raw(&SyncMessage::peer_joined(self.session_id, meta)?).await
    }

    async fn untrack(&self) -> Result<(), TransportError> {
        self.send_raw(&SyncMessage::peer_left(self.participant_id, self.session_id))
            .await
    }

    async fn presence_state(&self) -> Vec<PresenceMeta> {
        let mut members: Vec<PresenceMeta> = self.presence.read().await.values().cloned().collect();
        members.sort_by_key(|m| m.participant_id);
        members
    }

    async fn unsubscribe(&mut self) {
        if let Some(handle) = self.forward.take() {
            handle.abort();
        }
        // Dropping the queue lets the writer close the socket.
        self.outgoing = None;
        self.reader = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        self.presence.write().await.clear();
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.forward.take() {
            handle.abort();
        }
    }
}
