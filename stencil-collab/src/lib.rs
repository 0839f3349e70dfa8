//! # stencil-collab — two-person live editing of a canvas template
//!
//! Wires the shared canvas state from `stencil-core` to a realtime channel
//! and manages who is in a session and where they are working.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐  create / join / leave  ┌──────────────┐
//! │ CollaborationSession │ ──────────────────────► │ SessionStore │
//! └─────────┬────────────┘                         └──────────────┘
//!           │ owns
//!           ▼
//! ┌──────────────────────┐  awareness   ┌──────────────────────────┐
//! │ SyncTransport        │ ───────────► │ EditingZoneCoordinator   │
//! │  SharedDocument (yrs)│              └──────────────────────────┘
//! └─────────┬────────────┘
//!           │ Channel (deltas, resync, awareness, presence)
//!     ┌─────┴───────────────┐
//!     ▼                     ▼
//! ┌──────────┐      ┌──────────────────┐  WebSocket  ┌─────────────┐
//! │ LocalHub │      │ WsChannelFactory │ ──────────► │ RelayServer │
//! └──────────┘      └──────────────────┘             └─────────────┘
//! ```
//!
//! `ReconnectManager` restores a dropped transport with bounded backoff.
//! `AutosaveScheduler` saves the local editor into a `DraftSink`, such as
//! the RocksDB-backed [`storage::DraftCache`].
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`] — per-session fan-out and presence map
//! - [`channel`] — `Channel` abstraction and the in-process `LocalHub`
//! - [`transport`] — document sync over a channel
//! - [`zones`] — advisory editing-zone claims and conflict detection
//! - [`session`] — session lifecycle and invite codes
//! - [`reconnect`] — backoff and recovery
//! - [`autosave`] — periodic draft saving
//! - [`server`] / [`client`] — WebSocket relay and its channel

pub mod autosave;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod identity;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;
pub mod transport;
pub mod zones;

pub use autosave::{AutosaveConfig, AutosaveScheduler, DraftSink, SaveOutcome};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame, RoomManager};
pub use channel::{Channel, ChannelEvent, ChannelFactory, LocalHub, TransportError};
pub use client::{WsChannel, WsChannelFactory};
pub use identity::{IdentityProvider, StaticIdentity, UserProfile};
pub use protocol::{
    AwarenessState, MessageType, PresenceMeta, ProtocolError, ResyncPayload, Role, SyncMessage, Zone,
};
pub use reconnect::{ReconnectConfig, ReconnectManager, ReconnectStatus};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{
    ActiveSession, CollaborationSession, SessionConfig, SessionError, SessionEvent,
    generate_invite_code, invite_link, normalize_invite_code,
};
pub use storage::{CachedDraftSink, Draft, DraftCache, DraftCacheConfig, DraftMetadata};
pub use store::{MemorySessionStore, Participant, SessionRecord, SessionStatus, SessionStore, StoreError};
pub use transport::{ConnectionState, SyncTransport, TransportConfig, TransportEvent};
pub use zones::{EditingZoneCoordinator, SelectionUpdate, ZoneClaim, ZoneConflict};
