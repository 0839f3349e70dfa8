//! Per-client editor state: slot list, selection, zoom/pan, undo history
//! and save tracking.
//!
//! Nothing here is shared with peers. Shared fields live in
//! [`SharedDocument`](crate::SharedDocument).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::history::{History, DEFAULT_CAPACITY};

pub const MIN_ZOOM: f64 = 0.25;
pub const MAX_ZOOM: f64 = 2.0;
pub const ZOOM_STEP: f64 = 0.1;

/// Offset applied to a duplicated slot so it does not sit exactly on top
/// of the original.
const DUPLICATE_OFFSET: f64 = 20.0;

#[derive(Error, Debug)]
pub enum EditorError {
    #[error("Slot not found: {0}")]
    SlotNotFound(String),
    #[error("Failed to serialize slots: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Image,
    Text,
    Shape,
}

/// A positioned element of a template.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub kind: SlotKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    pub z_index: i32,
    pub content: Option<String>,
}

impl Slot {
    pub fn new(kind: SlotKind, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            x,
            y,
            width,
            height,
            rotation: 0.0,
            z_index: 0,
            content: None,
        }
    }
}

/// Pan offset of the editor viewport.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    pub pan_x: f64,
    pub pan_y: f64,
}

impl Viewport {
    pub fn pan(&mut self, dx: f64, dy: f64, zoom: f64) {
        self.pan_x -= dx / zoom;
        self.pan_y -= dy / zoom;
    }
}

pub struct LocalEditorStore {
    slots: Vec<Slot>,
    selected: Option<String>,
    zoom: f64,
    viewport: Viewport,
    history: History<Vec<Slot>>,
    dirty: bool,
    saving: bool,
    /// Serialized slot list as of the last successful save.
    last_saved: Option<String>,
}

impl LocalEditorStore {
    /// Start editing `slots`, which are taken to be the saved state.
    pub fn new(slots: Vec<Slot>) -> Self {
        let last_saved = serde_json::to_string(&slots).ok();
        Self {
            history: History::new(slots.clone(), DEFAULT_CAPACITY),
            slots,
            selected: None,
            zoom: 1.0,
            viewport: Viewport::default(),
            dirty: false,
            saving: false,
            last_saved,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, id: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn history(&self) -> &History<Vec<Slot>> {
        &self.history
    }

    // ─── Selection & viewport ─────────────────────────────────────────

    pub fn select(&mut self, id: Option<&str>) {
        self.selected = id.filter(|id| self.slot(id).is_some()).map(str::to_string);
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// Set zoom, clamped to `[MIN_ZOOM, MAX_ZOOM]`. Returns the applied value.
    ///
    /// Non-finite input leaves the zoom unchanged.
    pub fn set_zoom(&mut self, zoom: f64) -> f64 {
        if zoom.is_finite() {
            self.zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
        }
        self.zoom
    }

    pub fn zoom_in(&mut self) -> f64 {
        self.step_zoom(ZOOM_STEP)
    }

    pub fn zoom_out(&mut self) -> f64 {
        self.step_zoom(-ZOOM_STEP)
    }

    // Steps land on whole hundredths so repeated steps don't drift.
    fn step_zoom(&mut self, delta: f64) -> f64 {
        self.set_zoom(((self.zoom + delta) * 100.0).round() / 100.0)
    }

    pub fn reset_zoom(&mut self) -> f64 {
        self.set_zoom(1.0)
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.viewport.pan(dx, dy, self.zoom);
    }

    // ─── Structural mutations ─────────────────────────────────────────

    pub fn add_slot(&mut self, mut slot: Slot) -> String {
        slot.z_index = self.next_z_index();
        let id = slot.id.clone();
        self.slots.push(slot);
        self.commit();
        id
    }

    pub fn update_slot<F>(&mut self, id: &str, f: F) -> Result<(), EditorError>
    where
        F: FnOnce(&mut Slot),
    {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| EditorError::SlotNotFound(id.to_string()))?;
        f(slot);
        self.commit();
        Ok(())
    }

    pub fn delete_slot(&mut self, id: &str) -> Result<Slot, EditorError> {
        let pos = self.position(id)?;
        let removed = self.slots.remove(pos);
        if self.selected.as_deref() == Some(id) {
            self.selected = None;
        }
        self.commit();
        Ok(removed)
    }

    /// Copy a slot under a fresh id, offset and placed on top. The copy
    /// becomes the selection.
    pub fn duplicate_slot(&mut self, id: &str) -> Result<String, EditorError> {
        let pos = self.position(id)?;
        let mut copy = self.slots[pos].clone();
        copy.id = Uuid::new_v4().to_string();
        copy.x += DUPLICATE_OFFSET;
        copy.y += DUPLICATE_OFFSET;
        copy.z_index = self.next_z_index();
        let new_id = copy.id.clone();
        self.slots.push(copy);
        self.selected = Some(new_id.clone());
        self.commit();
        Ok(new_id)
    }

    /// Move a slot to `to` in paint order; z indices are renumbered.
    pub fn reorder_slot(&mut self, id: &str, to: usize) -> Result<(), EditorError> {
        let from = self.position(id)?;
        let slot = self.slots.remove(from);
        let to = to.min(self.slots.len());
        self.slots.insert(to, slot);
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.z_index = i as i32;
        }
        self.commit();
        Ok(())
    }

    fn position(&self, id: &str) -> Result<usize, EditorError> {
        self.slots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| EditorError::SlotNotFound(id.to_string()))
    }

    fn next_z_index(&self) -> i32 {
        self.slots.iter().map(|s| s.z_index + 1).max().unwrap_or(0)
    }

    fn commit(&mut self) {
        self.history.push(self.slots.clone());
        self.dirty = true;
    }

    // ─── Undo / redo ──────────────────────────────────────────────────

    /// Returns false at the oldest snapshot.
    pub fn undo(&mut self) -> bool {
        match self.history.undo() {
            Some(snapshot) => {
                self.slots = snapshot.clone();
                self.after_restore();
                true
            }
            None => false,
        }
    }

    /// Returns false at the newest snapshot.
    pub fn redo(&mut self) -> bool {
        match self.history.redo() {
            Some(snapshot) => {
                self.slots = snapshot.clone();
                self.after_restore();
                true
            }
            None => false,
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn after_restore(&mut self) {
        if let Some(id) = &self.selected {
            if !self.slots.iter().any(|s| &s.id == id) {
                self.selected = None;
            }
        }
        self.dirty = true;
    }

    // ─── Save tracking ────────────────────────────────────────────────

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    pub fn serialize_slots(&self) -> Result<String, EditorError> {
        Ok(serde_json::to_string(&self.slots)?)
    }

    /// Snapshot to save, if a save is warranted right now.
    ///
    /// A dirty store whose slots serialize identically to the last save is
    /// quietly marked clean.
    pub fn autosave_candidate(&mut self) -> Result<Option<String>, EditorError> {
        if !self.dirty || self.saving {
            return Ok(None);
        }
        let snapshot = self.serialize_slots()?;
        if self.last_saved.as_deref() == Some(snapshot.as_str()) {
            self.dirty = false;
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// Take the autosave candidate and mark a save in flight.
    pub fn begin_save(&mut self) -> Result<Option<String>, EditorError> {
        let candidate = self.autosave_candidate()?;
        if candidate.is_some() {
            self.saving = true;
        }
        Ok(candidate)
    }

    /// Record the result of a save started with [`begin_save`](Self::begin_save).
    ///
    /// Edits made while the save was in flight keep the store dirty.
    pub fn finish_save(&mut self, snapshot: String, success: bool) {
        self.saving = false;
        if !success {
            return;
        }
        let unchanged = self
            .serialize_slots()
            .map(|current| current == snapshot)
            .unwrap_or(false);
        if unchanged {
            self.dirty = false;
        }
        self.last_saved = Some(snapshot);
    }

    /// Drop the in-flight flag of a save whose result will not be recorded.
    ///
    /// `dirty` and the last saved snapshot are left as they were, so the
    /// next autosave picks the work up again.
    pub fn abandon_save(&mut self) {
        self.saving = false;
    }

    /// Whether leaving the editor would lose work.
    pub fn should_confirm_exit(&self) -> bool {
        self.dirty || self.saving
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_slot() -> (LocalEditorStore, String) {
        let mut store = LocalEditorStore::new(Vec::new());
        let id = store.add_slot(Slot::new(SlotKind::Image, 0.0, 0.0, 100.0, 100.0));
        (store, id)
    }

    #[test]
    fn test_zoom_clamp() {
        let mut store = LocalEditorStore::new(Vec::new());
        assert_eq!(store.set_zoom(3.0), 2.0);
        assert_eq!(store.set_zoom(0.1), 0.25);
        assert_eq!(store.set_zoom(1.5), 1.5);
        assert_eq!(store.set_zoom(1.234), 1.234);
    }

    #[test]
    fn test_zoom_ignores_non_finite() {
        let mut store = LocalEditorStore::new(Vec::new());
        store.set_zoom(2.0);
        assert_eq!(store.set_zoom(f64::NAN), 2.0);
        assert_eq!(store.set_zoom(f64::INFINITY), 2.0);

        store.pan(10.0, 10.0);
        let viewport = store.viewport();
        assert!(viewport.pan_x.is_finite() && viewport.pan_y.is_finite());
    }

    #[test]
    fn test_zoom_steps() {
        let mut store = LocalEditorStore::new(Vec::new());
        assert_eq!(store.zoom_in(), 1.1);
        assert_eq!(store.zoom_out(), 1.0);
        for _ in 0..30 {
            store.zoom_out();
        }
        assert_eq!(store.zoom(), MIN_ZOOM);
        assert_eq!(store.reset_zoom(), 1.0);
    }

    #[test]
    fn test_pan_scales_with_zoom() {
        let mut store = LocalEditorStore::new(Vec::new());
        store.set_zoom(2.0);
        store.pan(100.0, 50.0);
        assert_eq!(store.viewport(), Viewport { pan_x: -50.0, pan_y: -25.0 });
    }

    #[test]
    fn test_mutations_push_history() {
        let (mut store, id) = store_with_slot();
        assert_eq!(store.history().len(), 2);
        assert!(store.is_dirty());

        store.update_slot(&id, |s| s.x = 42.0).unwrap();
        assert_eq!(store.history().len(), 3);
        assert_eq!(store.slot(&id).unwrap().x, 42.0);

        assert!(store.undo());
        assert_eq!(store.slot(&id).unwrap().x, 0.0);
        assert!(store.redo());
        assert_eq!(store.slot(&id).unwrap().x, 42.0);
    }

    #[test]
    fn test_undo_at_bounds_is_noop() {
        let mut store = LocalEditorStore::new(Vec::new());
        assert!(!store.undo());
        assert!(!store.redo());
        assert!(store.slots().is_empty());
    }

    #[test]
    fn test_history_bounded() {
        let (mut store, id) = store_with_slot();
        for i in 0..60 {
            store.update_slot(&id, |s| s.x = i as f64).unwrap();
        }
        assert_eq!(store.history().len(), DEFAULT_CAPACITY);

        let mut steps = 0;
        while store.undo() {
            steps += 1;
        }
        assert_eq!(steps, DEFAULT_CAPACITY - 1);
        assert_eq!(store.history().index(), 0);
    }

    #[test]
    fn test_unknown_slot() {
        let mut store = LocalEditorStore::new(Vec::new());
        assert!(matches!(
            store.update_slot("missing", |_| {}),
            Err(EditorError::SlotNotFound(_))
        ));
        assert!(store.delete_slot("missing").is_err());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_duplicate_offsets_and_selects() {
        let (mut store, id) = store_with_slot();
        let copy = store.duplicate_slot(&id).unwrap();

        assert_ne!(copy, id);
        let dup = store.slot(&copy).unwrap();
        assert_eq!((dup.x, dup.y), (20.0, 20.0));
        assert!(dup.z_index > store.slot(&id).unwrap().z_index);
        assert_eq!(store.selected(), Some(copy.as_str()));
    }

    #[test]
    fn test_delete_clears_selection() {
        let (mut store, id) = store_with_slot();
        store.select(Some(&id));
        store.delete_slot(&id).unwrap();
        assert!(store.selected().is_none());

        // Undo restores the slot but not the selection.
        store.undo();
        assert!(store.slot(&id).is_some());
    }

    #[test]
    fn test_reorder_renumbers() {
        let mut store = LocalEditorStore::new(Vec::new());
        let a = store.add_slot(Slot::new(SlotKind::Text, 0.0, 0.0, 10.0, 10.0));
        let b = store.add_slot(Slot::new(SlotKind::Shape, 0.0, 0.0, 10.0, 10.0));
        store.reorder_slot(&b, 0).unwrap();

        assert_eq!(store.slots()[0].id, b);
        assert_eq!(store.slot(&b).unwrap().z_index, 0);
        assert_eq!(store.slot(&a).unwrap().z_index, 1);
    }

    #[test]
    fn test_autosave_lifecycle() {
        let (mut store, id) = store_with_slot();

        let snapshot = store.begin_save().unwrap().expect("dirty store has a candidate");
        assert!(store.is_saving());
        assert!(store.should_confirm_exit());
        // Nothing new to save while one is in flight.
        assert!(store.begin_save().unwrap().is_none());

        store.finish_save(snapshot, true);
        assert!(!store.is_dirty());
        assert!(!store.should_confirm_exit());

        store.update_slot(&id, |s| s.rotation = 45.0).unwrap();
        assert!(store.autosave_candidate().unwrap().is_some());
    }

    #[test]
    fn test_edit_during_save_stays_dirty() {
        let (mut store, id) = store_with_slot();
        let snapshot = store.begin_save().unwrap().unwrap();
        store.update_slot(&id, |s| s.width = 300.0).unwrap();
        store.finish_save(snapshot, true);

        assert!(store.is_dirty());
        assert!(store.autosave_candidate().unwrap().is_some());
    }

    #[test]
    fn test_abandoned_save_can_be_retried() {
        let (mut store, id) = store_with_slot();
        store.begin_save().unwrap().unwrap();
        store.abandon_save();

        assert!(!store.is_saving());
        assert!(store.is_dirty());
        store.update_slot(&id, |s| s.x = 7.0).unwrap();
        assert!(store.autosave_candidate().unwrap().is_some());
        assert!(store.should_confirm_exit());
    }

    #[test]
    fn test_failed_save_keeps_dirty() {
        let (mut store, _) = store_with_slot();
        let snapshot = store.begin_save().unwrap().unwrap();
        store.finish_save(snapshot, false);

        assert!(store.is_dirty());
        assert!(!store.is_saving());
    }

    #[test]
    fn test_unchanged_candidate_clears_dirty() {
        let (mut store, id) = store_with_slot();
        let snapshot = store.begin_save().unwrap().unwrap();
        store.finish_save(snapshot, true);

        // Edit and undo back to the saved layout.
        store.update_slot(&id, |s| s.x = 5.0).unwrap();
        store.undo();
        assert!(store.is_dirty());
        assert!(store.autosave_candidate().unwrap().is_none());
        assert!(!store.is_dirty());
    }
}
