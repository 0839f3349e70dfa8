//! Session lifecycle: create, join, leave, end.
//!
//! ```text
//!            create            join (first guest)
//!   (none) ─────────► waiting ───────────────────► active
//!                       │  ▲      leave (last guest)  │
//!                       │  └──────────────────────────┘
//!                       │                             │ end (host)
//!                       ├── expires_at passed ──► expired
//!                       └─────────────── end ─────────┴──► completed
//! ```
//!
//! A `CollaborationSession` holds at most one active session. Joining or
//! creating attaches a [`SyncTransport`] and an [`EditingZoneCoordinator`];
//! leaving or ending tears them down.

use std::sync::Arc;

use chrono::Utc;
use stencil_core::{Delta, DocumentError, SharedDocument};
use thiserror::Error;
use uuid::Uuid;

use crate::channel::ChannelFactory;
use crate::identity::{IdentityProvider, UserProfile};
use crate::protocol::{AwarenessState, PresenceMeta, Role, Zone};
use crate::store::{Participant, SessionRecord, SessionStatus, SessionStore, StoreError};
use crate::transport::{SyncTransport, TransportConfig, TransportEvent};
use crate::zones::{EditingZoneCoordinator, ZoneClaim, ZoneConflict, DEFAULT_TOUCH_THROTTLE};

/// Symbols used in invite codes. No `I`, `O`, `0` or `1`.
pub const INVITE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const INVITE_CODE_LEN: usize = 6;

/// Conditional writes tried before a busy record is reported as a conflict.
const RECORD_WRITE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_participants: usize,
    pub invite_ttl: chrono::Duration,
    /// Fresh codes tried before giving up on a collision streak.
    pub max_code_attempts: usize,
    pub touch_throttle: std::time::Duration,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_participants: 2,
            invite_ttl: chrono::Duration::hours(24),
            max_code_attempts: 10,
            touch_throttle: DEFAULT_TOUCH_THROTTLE,
            transport: TransportConfig::default(),
        }
    }
}

/// Messages are written for display to the user as-is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Sign in to start or join a collaboration session")]
    NotAuthenticated,
    #[error("No open session matches invite code {0}")]
    NotFound(String),
    #[error("This invite link has expired")]
    Expired,
    #[error("This session is already full")]
    Full,
    #[error("Only the host can end the session")]
    NotHost,
    #[error("You are not in a collaboration session")]
    NoActiveSession,
    #[error("Could not save the session: {0}")]
    Store(#[from] StoreError),
    #[error("Could not apply the edit: {0}")]
    Document(#[from] DocumentError),
}

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocumentChanged { by: Uuid },
    Resynced { from: Uuid },
    Presence(Vec<PresenceMeta>),
    Awareness(AwarenessState),
    /// A peer selected what we have selected. Advisory only.
    Conflict(ZoneConflict),
    Disconnected,
}

/// Everything attached while a session is joined.
pub struct ActiveSession {
    pub record: SessionRecord,
    pub role: Role,
    pub user: UserProfile,
    pub transport: SyncTransport,
    pub zones: EditingZoneCoordinator,
}

pub struct CollaborationSession {
    config: SessionConfig,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
    channels: Arc<dyn ChannelFactory>,
    active: Option<ActiveSession>,
}

impl CollaborationSession {
    pub fn new(
        config: SessionConfig,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        channels: Arc<dyn ChannelFactory>,
    ) -> Self {
        Self {
            config,
            identity,
            store,
            channels,
            active: None,
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Start hosting a session for `work_id`.
    pub async fn create_session(
        &mut self,
        work_id: &str,
        template_id: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let user = self.require_user().await?;
        if self.active.is_some() {
            self.leave_session().await?;
        }

        let code = self.unique_invite_code().await?;
        let record = SessionRecord::new(
            user.id,
            work_id,
            template_id.map(str::to_string),
            code,
            self.config.max_participants,
            self.config.invite_ttl,
        );
        self.store.insert(record.clone()).await?;
        log::info!(
            "Session {} created for work {} (code {})",
            record.id,
            record.work_id,
            record.invite_code
        );

        self.attach(record.clone(), Role::Host, user).await;
        Ok(record)
    }

    async fn unique_invite_code(&self) -> Result<String, SessionError> {
        let mut last = String::new();
        for _ in 0..self.config.max_code_attempts.max(1) {
            let code = generate_invite_code();
            if !self.store.code_exists(&code).await? {
                return Ok(code);
            }
            log::debug!("Invite code collision on {code}, retrying");
            last = code;
        }
        Err(StoreError::DuplicateCode(last).into())
    }

    /// Join a waiting session by invite code (case-insensitive).
    ///
    /// The record is written with a compare-and-swap; when another writer
    /// got in first the lookup starts over, so a guest who lost the race
    /// sees the session as taken.
    pub async fn join_session(&mut self, code: &str) -> Result<SessionRecord, SessionError> {
        let user = self.require_user().await?;
        let code = normalize_invite_code(code);

        let mut attempts = 0;
        let (record, role) = loop {
            let current = self
                .store
                .find_by_code(&code)
                .await?
                .filter(|r| r.status == SessionStatus::Waiting)
                .ok_or_else(|| SessionError::NotFound(code.clone()))?;
            let mut record = current.clone();

            if record.is_expired(Utc::now()) {
                record.status = SessionStatus::Expired;
                if self.store.compare_and_swap(&current, record).await? {
                    log::info!("Join refused, invite {code} expired");
                    return Err(SessionError::Expired);
                }
            } else if user.id == record.host_id {
                break (record, Role::Host);
            } else {
                if record.participant(&user.id).is_none() {
                    if record.is_full() {
                        log::info!("Join refused, session {} full", record.id);
                        return Err(SessionError::Full);
                    }
                    record.participants.push(Participant {
                        user_id: user.id,
                        nickname: user.nickname.clone(),
                        avatar_url: user.avatar_url.clone(),
                        joined_at: Utc::now(),
                        role: Role::Guest,
                        is_online: true,
                    });
                }
                record.status = SessionStatus::Active;
                if self.store.compare_and_swap(&current, record.clone()).await? {
                    break (record, Role::Guest);
                }
            }

            attempts += 1;
            if attempts >= RECORD_WRITE_ATTEMPTS {
                return Err(StoreError::Conflict(current.id).into());
            }
            log::debug!("Session {} changed during join, retrying", current.id);
        };

        if self.active.is_some() {
            self.leave_session().await?;
        }
        log::info!("{} joined session {} as {:?}", user.nickname, record.id, role);
        self.attach(record.clone(), role, user).await;
        Ok(record)
    }

    async fn attach(&mut self, record: SessionRecord, role: Role, user: UserProfile) {
        let meta = PresenceMeta::new(user.id, user.nickname.clone(), role)
            .with_avatar(user.avatar_url.clone());
        let mut transport = SyncTransport::new(
            self.channels.clone(),
            record.id,
            meta,
            record.host_id,
            self.config.transport.clone(),
        );
        // Failure leaves the document local-only; reconnect picks it up.
        let _ = transport.connect().await;

        let zones = EditingZoneCoordinator::with_throttle(user.id, self.config.touch_throttle);
        self.active = Some(ActiveSession {
            record,
            role,
            user,
            transport,
            zones,
        });
    }

    /// Leave the current session. The transport is torn down even if the
    /// record could not be updated.
    pub async fn leave_session(&mut self) -> Result<(), SessionError> {
        let mut active = self.active.take().ok_or(SessionError::NoActiveSession)?;
        active.zones.cancel_pending();
        active.transport.disconnect().await;

        let user_id = active.user.id;
        self.modify_record(active.record.id, |record| {
            record.participants.retain(|p| p.user_id != user_id);
            if record.status.is_open() {
                record.status = if record.participants.is_empty() {
                    SessionStatus::Waiting
                } else {
                    SessionStatus::Active
                };
            }
        })
        .await?;
        log::info!("{} left session {}", active.user.nickname, active.record.id);
        Ok(())
    }

    /// Close the session for good. Host only; only the host's own
    /// transport is torn down here.
    pub async fn end_session(&mut self) -> Result<SessionRecord, SessionError> {
        match &self.active {
            None => return Err(SessionError::NoActiveSession),
            Some(active) if active.role != Role::Host => return Err(SessionError::NotHost),
            Some(_) => {}
        }
        let Some(mut active) = self.active.take() else {
            return Err(SessionError::NoActiveSession);
        };
        active.zones.cancel_pending();
        active.transport.disconnect().await;

        let record = self
            .modify_record(active.record.id, |record| {
                record.status = SessionStatus::Completed;
                record.completed_at = Some(Utc::now());
            })
            .await?
            .ok_or(StoreError::NotFound(active.record.id))?;
        log::info!("Session {} ended by host", record.id);
        Ok(record)
    }

    /// Read-modify-write of a stored record, retried while other writers
    /// get in between. `None` if the record is gone.
    async fn modify_record<F>(
        &self,
        id: Uuid,
        mut change: F,
    ) -> Result<Option<SessionRecord>, SessionError>
    where
        F: FnMut(&mut SessionRecord) + Send,
    {
        for _ in 0..RECORD_WRITE_ATTEMPTS {
            let Some(current) = self.store.get(id).await? else {
                return Ok(None);
            };
            let mut record = current.clone();
            change(&mut record);
            if self.store.compare_and_swap(&current, record.clone()).await? {
                return Ok(Some(record));
            }
            log::debug!("Session {id} changed underneath, retrying");
        }
        Err(StoreError::Conflict(id).into())
    }

    async fn require_user(&self) -> Result<UserProfile, SessionError> {
        self.identity
            .current_user()
            .await
            .ok_or(SessionError::NotAuthenticated)
    }

    // ─── Editing ──────────────────────────────────────────────────────

    pub async fn edit<F>(&mut self, f: F) -> Result<Delta, SessionError>
    where
        F: FnOnce(&mut SharedDocument) -> Delta,
    {
        let active = self.active_mut()?;
        Ok(active.transport.edit(f).await)
    }

    pub async fn try_edit<F>(&mut self, f: F) -> Result<Delta, SessionError>
    where
        F: FnOnce(&mut SharedDocument) -> Result<Delta, DocumentError>,
    {
        let active = self.active_mut()?;
        Ok(active.transport.try_edit(f).await?)
    }

    pub async fn claim_zone(&mut self, zone: Zone) -> Result<ZoneClaim, SessionError> {
        let active = self.active_mut()?;
        let claim = active.zones.claim_zone(zone);
        broadcast(&active.transport, &claim.awareness).await;
        Ok(claim)
    }

    pub async fn release_zone(&mut self) -> Result<(), SessionError> {
        let active = self.active_mut()?;
        let awareness = active.zones.release_zone();
        broadcast(&active.transport, &awareness).await;
        Ok(())
    }

    pub async fn select_slot(
        &mut self,
        slot_id: Option<&str>,
    ) -> Result<Vec<ZoneConflict>, SessionError> {
        let active = self.active_mut()?;
        let update = active.zones.select_slot(slot_id.map(str::to_string));
        broadcast(&active.transport, &update.awareness).await;
        Ok(update.conflicts)
    }

    pub async fn select_text(
        &mut self,
        text_id: Option<&str>,
    ) -> Result<Vec<ZoneConflict>, SessionError> {
        let active = self.active_mut()?;
        let update = active.zones.select_text(text_id.map(str::to_string));
        broadcast(&active.transport, &update.awareness).await;
        Ok(update.conflicts)
    }

    /// Note local activity; broadcast subject to throttling.
    pub async fn touch(&mut self) -> Result<(), SessionError> {
        let active = self.active_mut()?;
        if let Some(awareness) = active.zones.touch() {
            broadcast(&active.transport, &awareness).await;
        }
        Ok(())
    }

    /// Wait for the next event. `None` when no session is attached or the
    /// transport has nothing to listen on.
    pub async fn poll_event(&mut self) -> Option<SessionEvent> {
        let active = self.active.as_mut()?;
        if let Some(awareness) = active.zones.flush_pending() {
            broadcast(&active.transport, &awareness).await;
        }
        let event = match active.transport.next_event().await? {
            TransportEvent::Disconnected => SessionEvent::Disconnected,
            TransportEvent::RemoteDelta { participant_id } => {
                SessionEvent::DocumentChanged { by: participant_id }
            }
            TransportEvent::StateSynced { from } => SessionEvent::Resynced { from },
            TransportEvent::RemoteAwareness(state) => match active.zones.handle_remote(state.clone()) {
                Some(conflict) => SessionEvent::Conflict(conflict),
                None => SessionEvent::Awareness(state),
            },
            TransportEvent::PresenceChanged(members) => {
                let ids: Vec<Uuid> = members.iter().map(|m| m.participant_id).collect();
                active.zones.retain_peers(&ids);
                SessionEvent::Presence(members)
            }
        };
        Some(event)
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    fn active_mut(&mut self) -> Result<&mut ActiveSession, SessionError> {
        self.active.as_mut().ok_or(SessionError::NoActiveSession)
    }

    pub fn transport(&self) -> Option<&SyncTransport> {
        self.active.as_ref().map(|a| &a.transport)
    }

    pub fn transport_mut(&mut self) -> Option<&mut SyncTransport> {
        self.active.as_mut().map(|a| &mut a.transport)
    }

    pub fn document(&self) -> Option<&SharedDocument> {
        self.transport().map(|t| t.document())
    }

    pub fn zones(&self) -> Option<&EditingZoneCoordinator> {
        self.active.as_ref().map(|a| &a.zones)
    }

    pub fn is_host(&self) -> bool {
        matches!(&self.active, Some(a) if a.role == Role::Host)
    }

    /// `<origin>/collab/<code>` for the active session.
    pub fn invite_link(&self, origin: &str) -> Result<String, SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NoActiveSession)?;
        Ok(invite_link(origin, &active.record.invite_code))
    }
}

async fn broadcast(transport: &SyncTransport, awareness: &AwarenessState) {
    if let Err(e) = transport.broadcast_awareness(awareness).await {
        log::warn!("Failed to broadcast awareness: {e}");
    }
}

/// Random code over [`INVITE_ALPHABET`]. 32 divides 256, so every symbol
/// is equally likely.
pub fn generate_invite_code() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(INVITE_CODE_LEN)
        .map(|b| INVITE_ALPHABET[(*b as usize) % INVITE_ALPHABET.len()] as char)
        .collect()
}

pub fn normalize_invite_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn invite_link(origin: &str, code: &str) -> String {
    format!("{}/collab/{}", origin.trim_end_matches('/'), code)
}
