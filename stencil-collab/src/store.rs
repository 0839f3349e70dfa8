//! Persisted session records and the store they live in.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::Role;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Session {0} not found")]
    NotFound(Uuid),
    #[error("Invite code {0} already in use")]
    DuplicateCode(String),
    #[error("Session {0} kept changing during update")]
    Conflict(Uuid),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Completed,
    Expired,
}

impl SessionStatus {
    /// Completed and expired sessions never change again.
    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Waiting | SessionStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub nickname: String,
    pub avatar_url: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub role: Role,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub host_id: Uuid,
    pub work_id: String,
    pub template_id: Option<String>,
    pub invite_code: String,
    /// Joined guests. The host is not listed.
    pub participants: Vec<Participant>,
    pub max_participants: usize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(
        host_id: Uuid,
        work_id: impl Into<String>,
        template_id: Option<String>,
        invite_code: impl Into<String>,
        max_participants: usize,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            host_id,
            work_id: work_id.into(),
            template_id,
            invite_code: invite_code.into(),
            participants: Vec::new(),
            max_participants,
            status: SessionStatus::Waiting,
            created_at,
            expires_at: created_at + ttl,
            completed_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    pub fn participant(&self, user_id: &Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }
}

/// Relational persistence for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `DuplicateCode` if the invite code is taken.
    async fn insert(&self, record: SessionRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError>;

    async fn find_by_code(&self, code: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError>;

    /// Overwrite an existing record.
    async fn update(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// Replace the record only if the stored copy still equals `expected`.
    /// Returns `false` when someone else wrote it first.
    async fn compare_and_swap(
        &self,
        expected: &SessionRecord,
        record: SessionRecord,
    ) -> Result<bool, StoreError>;
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.values().any(|r| r.invite_code == record.invite_code) {
            return Err(StoreError::DuplicateCode(record.invite_code));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.invite_code == code)
            .cloned())
    }

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .any(|r| r.invite_code == code))
    }

    async fn update(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    async fn compare_and_swap(
        &self,
        expected: &SessionRecord,
        record: SessionRecord,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) if existing == expected => {
                *existing = record;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(record.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str) -> SessionRecord {
        SessionRecord::new(Uuid::new_v4(), "w1", None, code, 2, Duration::hours(24))
    }

    #[test]
    fn test_new_record_defaults() {
        let r = record("ABC234");
        assert_eq!(r.status, SessionStatus::Waiting);
        assert!(r.participants.is_empty());
        assert_eq!(r.max_participants, 2);
        assert_eq!(r.expires_at - r.created_at, Duration::hours(24));
        assert!(!r.is_expired(r.created_at));
        assert!(r.is_expired(r.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn test_record_json_field_names() {
        let json = serde_json::to_value(record("ABC234")).unwrap();
        for key in [
            "id",
            "host_id",
            "work_id",
            "template_id",
            "invite_code",
            "participants",
            "max_participants",
            "status",
            "created_at",
            "expires_at",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["invite_code"], "ABC234");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["max_participants"], 2);
        assert!(json.get("inviteCode").is_none());
    }

    #[test]
    fn test_participant_json_field_names() {
        let participant = Participant {
            user_id: Uuid::new_v4(),
            nickname: "Ann".into(),
            avatar_url: None,
            joined_at: Utc::now(),
            role: Role::Guest,
            is_online: true,
        };
        let json = serde_json::to_value(&participant).unwrap();
        for key in ["user_id", "nickname", "avatar_url", "joined_at", "role", "is_online"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_status_open() {
        assert!(SessionStatus::Waiting.is_open());
        assert!(SessionStatus::Active.is_open());
        assert!(!SessionStatus::Completed.is_open());
        assert!(!SessionStatus::Expired.is_open());
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySessionStore::new();
        let mut r = record("ABC234");
        store.insert(r.clone()).await.unwrap();

        assert!(store.code_exists("ABC234").await.unwrap());
        assert!(!store.code_exists("ZZZZZZ").await.unwrap());
        assert_eq!(store.find_by_code("ABC234").await.unwrap(), Some(r.clone()));

        r.status = SessionStatus::Active;
        store.update(r.clone()).await.unwrap();
        assert_eq!(store.get(r.id).await.unwrap().unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_memory_store_duplicate_code() {
        let store = MemorySessionStore::new();
        store.insert(record("ABC234")).await.unwrap();
        let err = store.insert(record("ABC234")).await.unwrap_err();
        assert_eq!(err, StoreError::DuplicateCode("ABC234".into()));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_copy() {
        let store = MemorySessionStore::new();
        let original = record("ABC234");
        store.insert(original.clone()).await.unwrap();

        let mut first = original.clone();
        first.status = SessionStatus::Active;
        assert!(store.compare_and_swap(&original, first.clone()).await.unwrap());

        // A writer still holding the original copy loses.
        let mut second = original.clone();
        second.status = SessionStatus::Expired;
        assert!(!store.compare_and_swap(&original, second).await.unwrap());
        assert_eq!(store.get(original.id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_memory_store_update_missing() {
        let store = MemorySessionStore::new();
        let r = record("ABC234");
        assert_eq!(store.update(r.clone()).await, Err(StoreError::NotFound(r.id)));
    }
}
