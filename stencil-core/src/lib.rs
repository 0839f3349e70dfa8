//! # stencil-core — shared canvas state for collaborative template editing
//!
//! Pure data and merge logic, no I/O:
//!
//! - [`document`] — `SharedDocument`, the yrs-backed mergeable canvas state
//! - [`editor`] — `LocalEditorStore`, per-client slots, zoom and save tracking
//! - [`history`] — bounded undo/redo buffer used by the editor store
//! - [`optimistic`] — apply-locally / confirm-remotely transitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod document;
pub mod editor;
pub mod history;
pub mod optimistic;

pub use document::{Delta, DocumentError, Origin, SharedDocument};
pub use editor::{EditorError, LocalEditorStore, Slot, SlotKind, Viewport};
pub use history::History;
pub use optimistic::{Optimistic, Reversible, Ticket};

/// Placement of a template slot on the shared canvas.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub rotation: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            rotation: 0.0,
        }
    }
}

/// A sticker dropped onto the canvas. Stickers are only ever appended.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sticker {
    pub id: String,
    pub image_url: String,
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub rotation: f64,
}

impl Sticker {
    pub fn new(image_url: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            image_url: image_url.into(),
            x,
            y,
            scale: 1.0,
            rotation: 0.0,
        }
    }
}

/// Flattened, read-only view of a [`SharedDocument`] for rendering and persistence.
///
/// Maps are ordered so two replicas holding the same state compare equal.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub form_data: BTreeMap<String, String>,
    pub images: BTreeMap<String, Option<String>>,
    pub colors: BTreeMap<String, String>,
    pub transforms: BTreeMap<String, Transform>,
    pub stickers: Vec<Sticker>,
}

impl SyncState {
    pub fn is_empty(&self) -> bool {
        self.form_data.is_empty()
            && self.images.is_empty()
            && self.colors.is_empty()
            && self.transforms.is_empty()
            && self.stickers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_json_field_names() {
        let mut state = SyncState::default();
        state.form_data.insert("title".into(), "Hello".into());
        state.images.insert("hero".into(), None);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["formData"]["title"], "Hello");
        assert!(json["images"]["hero"].is_null());
        assert!(json["stickers"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_sticker_ids_unique() {
        let a = Sticker::new("a.png", 0.0, 0.0);
        let b = Sticker::new("a.png", 0.0, 0.0);
        assert_ne!(a.id, b.id);
        assert_eq!(a.scale, 1.0);
    }

    #[test]
    fn test_sync_state_is_empty() {
        let mut state = SyncState::default();
        assert!(state.is_empty());
        state.colors.insert("bg".into(), "#fff".into());
        assert!(!state.is_empty());
    }
}
