//! Advisory editing zones and selection-conflict detection.
//!
//! Zones are soft locks: claiming one tells peers where you are working,
//! it never stops anybody from editing. A conflict is reported when a peer
//! selects the same slot or text as the local participant, once per
//! transition into that state.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::protocol::{now_millis, AwarenessState, Zone};

/// A peer counts as active if heard from within this window.
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(5);

/// Minimum spacing between activity-only awareness broadcasts.
pub const DEFAULT_TOUCH_THROTTLE: Duration = Duration::from_millis(500);

/// Two participants are working on the same thing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneConflict {
    pub other: Uuid,
    pub slot_id: Option<String>,
    pub text_id: Option<String>,
}

/// Result of claiming a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneClaim {
    /// Awareness to broadcast.
    pub awareness: AwarenessState,
    /// Peers already holding the same zone. The claim stands regardless.
    pub contested_by: Vec<Uuid>,
}

/// Result of changing the local selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionUpdate {
    pub awareness: AwarenessState,
    /// Conflicts this selection newly created.
    pub conflicts: Vec<ZoneConflict>,
}

pub struct EditingZoneCoordinator {
    local: AwarenessState,
    peers: HashMap<Uuid, AwarenessState>,
    /// Peers currently in conflict with us, to report each transition once.
    conflicted: HashSet<Uuid>,
    throttle: Duration,
    last_sent: Option<Instant>,
    pending: Option<AwarenessState>,
}

impl EditingZoneCoordinator {
    pub fn new(participant_id: Uuid) -> Self {
        Self::with_throttle(participant_id, DEFAULT_TOUCH_THROTTLE)
    }

    pub fn with_throttle(participant_id: Uuid, throttle: Duration) -> Self {
        Self {
            local: AwarenessState::new(participant_id),
            peers: HashMap::new(),
            conflicted: HashSet::new(),
            throttle,
            last_sent: None,
            pending: None,
        }
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    pub fn participant_id(&self) -> Uuid {
        self.local.participant_id
    }

    // ─── Local changes ────────────────────────────────────────────────

    pub fn claim_zone(&mut self, zone: Zone) -> ZoneClaim {
        self.local.zone = Some(zone);
        let contested_by = self.zone_holders(zone);
        if !contested_by.is_empty() {
            log::debug!("Zone {:?} also held by {:?}", zone, contested_by);
        }
        ZoneClaim {
            awareness: self.stamp(),
            contested_by,
        }
    }

    pub fn release_zone(&mut self) -> AwarenessState {
        self.local.zone = None;
        self.stamp()
    }

    pub fn select_slot(&mut self, slot_id: Option<String>) -> SelectionUpdate {
        self.local.selected_slot_id = slot_id;
        self.after_selection()
    }

    pub fn select_text(&mut self, text_id: Option<String>) -> SelectionUpdate {
        self.local.selected_text_id = text_id;
        self.after_selection()
    }

    fn after_selection(&mut self) -> SelectionUpdate {
        let ids: Vec<Uuid> = self.peers.keys().copied().collect();
        let conflicts = ids.into_iter().filter_map(|id| self.evaluate(id)).collect();
        SelectionUpdate {
            awareness: self.stamp(),
            conflicts,
        }
    }

    /// Refresh local activity. Returns awareness to send now, or `None` if
    /// throttled (the update is then held as pending).
    pub fn touch(&mut self) -> Option<AwarenessState> {
        self.local.last_activity = self.next_activity();
        if self.throttled() {
            self.pending = Some(self.local.clone());
            return None;
        }
        Some(self.mark_sent())
    }

    /// Pending awareness whose throttle window has passed.
    pub fn flush_pending(&mut self) -> Option<AwarenessState> {
        if self.pending.is_none() || self.throttled() {
            return None;
        }
        Some(self.mark_sent())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop any awareness not yet sent.
    pub fn cancel_pending(&mut self) {
        self.pending = None;
    }

    fn throttled(&self) -> bool {
        self.last_sent
            .map(|t| t.elapsed() < self.throttle)
            .unwrap_or(false)
    }

    fn stamp(&mut self) -> AwarenessState {
        self.local.last_activity = self.next_activity();
        self.mark_sent()
    }

    fn mark_sent(&mut self) -> AwarenessState {
        self.pending = None;
        self.last_sent = Some(Instant::now());
        self.local.clone()
    }

    /// Strictly increasing, so peers can order our updates.
    fn next_activity(&self) -> u64 {
        now_millis().max(self.local.last_activity + 1)
    }

    // ─── Remote changes ───────────────────────────────────────────────

    /// Record a peer's awareness. Older states than the one held are
    /// ignored.
    pub fn handle_remote(&mut self, state: AwarenessState) -> Option<ZoneConflict> {
        let id = state.participant_id;
        if id == self.local.participant_id {
            return None;
        }
        if let Some(existing) = self.peers.get(&id) {
            if existing.last_activity > state.last_activity {
                log::trace!("Stale awareness from {id}");
                return None;
            }
        }
        self.peers.insert(id, state);
        self.evaluate(id)
    }

    pub fn remove_peer(&mut self, participant_id: &Uuid) -> Option<AwarenessState> {
        self.conflicted.remove(participant_id);
        self.peers.remove(participant_id)
    }

    /// Forget peers no longer present.
    pub fn retain_peers(&mut self, present: &[Uuid]) {
        self.peers.retain(|id, _| present.contains(id));
        self.conflicted.retain(|id| present.contains(id));
    }

    /// Re-check one peer; report only a fresh conflict.
    fn evaluate(&mut self, id: Uuid) -> Option<ZoneConflict> {
        let peer = self.peers.get(&id)?;
        let slot = shared(&self.local.selected_slot_id, &peer.selected_slot_id);
        let text = shared(&self.local.selected_text_id, &peer.selected_text_id);

        if slot.is_none() && text.is_none() {
            self.conflicted.remove(&id);
            return None;
        }
        if !self.conflicted.insert(id) {
            return None;
        }
        log::info!("Selection conflict with {id}");
        Some(ZoneConflict {
            other: id,
            slot_id: slot,
            text_id: text,
        })
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn peer(&self, participant_id: &Uuid) -> Option<&AwarenessState> {
        self.peers.get(participant_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &AwarenessState> {
        self.peers.values()
    }

    pub fn zone_holders(&self, zone: Zone) -> Vec<Uuid> {
        let mut holders: Vec<Uuid> = self
            .peers
            .values()
            .filter(|p| p.zone == Some(zone))
            .map(|p| p.participant_id)
            .collect();
        holders.sort();
        holders
    }

    pub fn in_conflict_with(&self, participant_id: &Uuid) -> bool {
        self.conflicted.contains(participant_id)
    }

    /// `now_ms` in milliseconds since the Unix epoch.
    pub fn is_active(&self, participant_id: &Uuid, now_ms: u64) -> bool {
        self.peers
            .get(participant_id)
            .map(|p| now_ms.saturating_sub(p.last_activity) <= ACTIVITY_WINDOW.as_millis() as u64)
            .unwrap_or(false)
    }
}

fn shared(local: &Option<String>, remote: &Option<String>) -> Option<String> {
    match (local, remote) {
        (Some(a), Some(b)) if a == b => Some(a.clone()),
        _ => None,
    }
}
