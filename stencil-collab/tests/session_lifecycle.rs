//! Session lifecycle over the in-process hub: two `CollaborationSession`s
//! sharing one store and one hub, the way a host and a guest share a
//! backend.

use std::sync::Arc;

use stencil_collab::channel::LocalHub;
use stencil_collab::identity::{StaticIdentity, UserProfile};
use stencil_collab::session::{CollaborationSession, SessionConfig, SessionError, SessionEvent};
use stencil_collab::store::{MemorySessionStore, Participant, SessionRecord, SessionStatus, SessionStore};
use stencil_collab::protocol::{Role, Zone};
use chrono::Utc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn session(user: UserProfile, store: &Arc<MemorySessionStore>, hub: &LocalHub, config: SessionConfig) -> CollaborationSession {
    CollaborationSession::new(
        config,
        Arc::new(StaticIdentity::signed_in(user)),
        store.clone(),
        Arc::new(hub.clone()),
    )
}

/// Collect events until the session goes quiet.
async fn pump(session: &mut CollaborationSession) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(50), session.poll_event()).await {
        events.push(event);
    }
    events
}

fn conflicts(events: &[SessionEvent]) -> Vec<Uuid> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Conflict(c) => Some(c.other),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_expired_join_rejected() {
    let hub = LocalHub::new();
    let store = Arc::new(MemorySessionStore::new());
    let expired = SessionConfig {
        invite_ttl: chrono::Duration::seconds(-1),
        ..SessionConfig::default()
    };
    let mut host = session(UserProfile::new("Host"), &store, &hub, expired);
    let mut guest = session(UserProfile::new("Guest"), &store, &hub, SessionConfig::default());

    let record = host.create_session("w1", None).await.unwrap();
    let err = guest.join_session(&record.invite_code).await.unwrap_err();
    assert_eq!(err, SessionError::Expired);
    assert!(guest.active().is_none());

    let stored = store.get(record.id).await.unwrap().unwrap();
    assert!(stored.participants.is_empty());
    assert_eq!(stored.status, SessionStatus::Expired);

    // Expired sessions no longer match an invite code.
    let again = guest.join_session(&record.invite_code).await.unwrap_err();
    assert_eq!(again, SessionError::NotFound(record.invite_code.clone()));
}

#[tokio::test]
async fn test_full_join_rejected() {
    let hub = LocalHub::new();
    let store = Arc::new(MemorySessionStore::new());

    let mut record = SessionRecord::new(Uuid::new_v4(), "w1", None, "FULL23", 2, chrono::Duration::hours(24));
    for name in ["Ann", "Ben"] {
        record.participants.push(Participant {
            user_id: Uuid::new_v4(),
            nickname: name.to_string(),
            avatar_url: None,
            joined_at: Utc::now(),
            role: Role::Guest,
            is_online: true,
        });
    }
    store.insert(record.clone()).await.unwrap();

    let mut late = session(UserProfile::new("Late"), &store, &hub, SessionConfig::default());
    assert_eq!(late.join_session("full23").await.unwrap_err(), SessionError::Full);
    assert!(late.active().is_none());

    let stored = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.participants, record.participants);
    assert_eq!(stored.status, SessionStatus::Waiting);
}

#[tokio::test]
async fn test_second_guest_cannot_join_active_session() {
    let hub = LocalHub::new();
    let store = Arc::new(MemorySessionStore::new());
    let mut host = session(UserProfile::new("Host"), &store, &hub, SessionConfig::default());
    let mut first = session(UserProfile::new("First"), &store, &hub, SessionConfig::default());
    let mut second = session(UserProfile::new("Second"), &store, &hub, SessionConfig::default());

    let record = host.create_session("w1", None).await.unwrap();
    first.join_session(&record.invite_code).await.unwrap();
    assert!(matches!(
        second.join_session(&record.invite_code).await,
        Err(SessionError::NotFound(_))
    ));

    // Once the first guest leaves the code works again.
    first.leave_session().await.unwrap();
    second.join_session(&record.invite_code).await.unwrap();
    assert_eq!(store.get(record.id).await.unwrap().unwrap().participants.len(), 1);
}

#[tokio::test]
async fn test_concurrent_selection_one_conflict_each() {
    let hub = LocalHub::new();
    let store = Arc::new(MemorySessionStore::new());
    let host_user = UserProfile::new("Host");
    let guest_user = UserProfile::new("Guest");
    let mut host = session(host_user.clone(), &store, &hub, SessionConfig::default());
    let mut guest = session(guest_user.clone(), &store, &hub, SessionConfig::default());

    let record = host.create_session("w1", None).await.unwrap();
    guest.join_session(&record.invite_code).await.unwrap();
    pump(&mut host).await;
    pump(&mut guest).await;

    let at_host = host.select_slot(Some("slot-7")).await.unwrap();
    let at_guest = guest.select_slot(Some("slot-7")).await.unwrap();
    assert!(at_host.is_empty());
    assert!(at_guest.is_empty());

    let host_events = pump(&mut host).await;
    let guest_events = pump(&mut guest).await;
    assert_eq!(conflicts(&host_events), vec![guest_user.id]);
    assert_eq!(conflicts(&guest_events), vec![host_user.id]);

    // Advisory only: both can still edit the slot.
    host.try_edit(|doc| {
        doc.set_transform("slot-7", &stencil_core::Transform { x: 10.0, ..Default::default() })
    })
    .await
    .unwrap();
    guest.try_edit(|doc| {
        doc.set_transform("slot-7", &stencil_core::Transform { y: 5.0, ..Default::default() })
    })
    .await
    .unwrap();

    // Zone claims are advisory too.
    host.claim_zone(Zone::A).await.unwrap();
    let claim = guest.claim_zone(Zone::A).await.unwrap();
    assert!(claim.contested_by.is_empty() || claim.contested_by == vec![host_user.id]);

    pump(&mut host).await;
    pump(&mut guest).await;
    assert_eq!(
        host.document().unwrap().sync_state().transforms,
        guest.document().unwrap().sync_state().transforms
    );
}

#[tokio::test]
async fn test_end_to_end_convergence() {
    let hub = LocalHub::new();
    let store = Arc::new(MemorySessionStore::new());
    let mut host = session(UserProfile::new("Host"), &store, &hub, SessionConfig::default());
    let mut guest = session(UserProfile::new("Guest"), &store, &hub, SessionConfig::default());

    let record = host.create_session("w1", None).await.unwrap();
    assert_eq!(record.status, SessionStatus::Waiting);
    assert!(record.participants.is_empty());

    let joined = guest.join_session(&record.invite_code).await.unwrap();
    assert_eq!(joined.status, SessionStatus::Active);
    assert_eq!(joined.participants.len(), 1);
    assert!(host.is_host());
    assert!(!guest.is_host());

    host.edit(|doc| doc.set_form_field("title", "Hello")).await.unwrap();
    guest.edit(|doc| doc.set_form_field("subtitle", "World")).await.unwrap();

    for _ in 0..3 {
        pump(&mut host).await;
        pump(&mut guest).await;
    }

    for replica in [&host, &guest] {
        let state = replica.document().unwrap().sync_state();
        assert_eq!(state.form_data.get("title").map(String::as_str), Some("Hello"));
        assert_eq!(state.form_data.get("subtitle").map(String::as_str), Some("World"));
    }

    guest.leave_session().await.unwrap();
    let ended = host.end_session().await.unwrap();
    assert_eq!(ended.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_guest_leave_shows_in_host_presence() {
    let hub = LocalHub::new();
    let store = Arc::new(MemorySessionStore::new());
    let guest_user = UserProfile::new("Guest");
    let mut host = session(UserProfile::new("Host"), &store, &hub, SessionConfig::default());
    let mut guest = session(guest_user.clone(), &store, &hub, SessionConfig::default());

    let record = host.create_session("w1", None).await.unwrap();
    guest.join_session(&record.invite_code).await.unwrap();
    pump(&mut host).await;
    assert_eq!(host.transport().unwrap().presence().len(), 2);

    guest.leave_session().await.unwrap();
    let events = pump(&mut host).await;
    let last = events.iter().rev().find_map(|e| match e {
        SessionEvent::Presence(members) => Some(members.clone()),
        _ => None,
    });
    let members = last.expect("no presence update after leave");
    assert_eq!(members.len(), 1);
    assert!(members.iter().all(|m| m.participant_id != guest_user.id));
}
