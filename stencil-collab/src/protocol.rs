//! Binary protocol for session channels.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ participant_id │ session_id │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes       │ 16 bytes   │ 8 bytes  │ variable │
//! └──────────┴────────────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! `clock` is the sender's wall-clock time in milliseconds. Payloads are
//! raw yrs bytes for `Delta`/`SyncStep1`, bincode for everything else.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Resync request carrying the sender's state vector
    SyncStep1 = 1,
    /// Resync answer: diff plus the responder's state vector
    SyncStep2 = 2,
    /// Incremental document delta
    Delta = 3,
    /// Zone / selection awareness
    Awareness = 4,
    /// Presence tracked (client → relay) or joined (relay → client)
    PeerJoined = 5,
    /// Presence untracked / participant gone
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Full presence membership (relay → client)
    PresenceSync = 9,
    /// Join a session channel (client → relay)
    Subscribe = 10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

/// Editing zone a participant can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Zone {
    A,
    B,
}

/// What a participant publishes about itself while connected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceMeta {
    pub participant_id: Uuid,
    pub name: String,
    /// `#rrggbb`, stable per participant.
    pub color: String,
    pub avatar_url: Option<String>,
    pub role: Role,
}

impl PresenceMeta {
    pub fn new(participant_id: Uuid, name: impl Into<String>, role: Role) -> Self {
        Self {
            participant_id,
            name: name.into(),
            color: participant_color(participant_id),
            avatar_url: None,
            role,
        }
    }

    pub fn with_avatar(mut self, avatar_url: Option<String>) -> Self {
        self.avatar_url = avatar_url;
        self
    }
}

/// Ephemeral zone/selection state. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwarenessState {
    pub participant_id: Uuid,
    pub zone: Option<Zone>,
    pub selected_slot_id: Option<String>,
    pub selected_text_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub last_activity: u64,
}

impl AwarenessState {
    pub fn new(participant_id: Uuid) -> Self {
        Self {
            participant_id,
            zone: None,
            selected_slot_id: None,
            selected_text_id: None,
            last_activity: now_millis(),
        }
    }
}

/// Answer to a resync request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResyncPayload {
    /// Participant that asked.
    pub target: Uuid,
    /// What the requester lacks.
    pub update: Vec<u8>,
    /// Responder's state vector, so the requester can send back what the
    /// responder lacks.
    pub state_vector: Vec<u8>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub participant_id: Uuid,
    pub session_id: Uuid,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, participant_id: Uuid, session_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            participant_id,
            session_id,
            clock: now_millis(),
            payload,
        }
    }

    pub fn delta(participant_id: Uuid, session_id: Uuid, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, participant_id, session_id, update)
    }

    pub fn sync_step1(participant_id: Uuid, session_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, participant_id, session_id, state_vector)
    }

    pub fn sync_step2(
        participant_id: Uuid,
        session_id: Uuid,
        resync: &ResyncPayload,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::SyncStep2, participant_id, session_id, encode_payload(resync)?))
    }

    pub fn awareness(session_id: Uuid, state: &AwarenessState) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Awareness,
            state.participant_id,
            session_id,
            encode_payload(state)?,
        ))
    }

    pub fn subscribe(participant_id: Uuid, session_id: Uuid) -> Self {
        Self::new(MessageType::Subscribe, participant_id, session_id, Vec::new())
    }

    pub fn peer_joined(session_id: Uuid, meta: &PresenceMeta) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::PeerJoined,
            meta.participant_id,
            session_id,
            encode_payload(meta)?,
        ))
    }

    pub fn peer_left(participant_id: Uuid, session_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, participant_id, session_id, Vec::new())
    }

    pub fn presence_sync(session_id: Uuid, members: &[PresenceMeta]) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::PresenceSync,
            Uuid::nil(),
            session_id,
            encode_payload(&members)?,
        ))
    }

    pub fn ping(participant_id: Uuid) -> Self {
        Self::new(MessageType::Ping, participant_id, Uuid::nil(), Vec::new())
    }

    pub fn pong(participant_id: Uuid) -> Self {
        Self::new(MessageType::Pong, participant_id, Uuid::nil(), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        self.expect_type(MessageType::Awareness)?;
        decode_payload(&self.payload)
    }

    pub fn resync(&self) -> Result<ResyncPayload, ProtocolError> {
        self.expect_type(MessageType::SyncStep2)?;
        decode_payload(&self.payload)
    }

    pub fn presence_meta(&self) -> Result<PresenceMeta, ProtocolError> {
        self.expect_type(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    pub fn presence_members(&self) -> Result<Vec<PresenceMeta>, ProtocolError> {
        self.expect_type(MessageType::PresenceSync)?;
        decode_payload(&self.payload)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == expected {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            })
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stable `#rrggbb` colour derived from a participant id.
pub fn participant_color(id: Uuid) -> String {
    let hue = (id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
