//! Mergeable canvas state backed by a yrs document.
//!
//! Root types:
//! ```text
//! formData   Y.Map<string>          LWW per key
//! images     Y.Map<string | null>   LWW per key
//! colors     Y.Map<string>          LWW per key
//! transforms Y.Map<json Transform>  LWW per slot id
//! stickers   Y.Array<json Sticker>  append-only
//! ```
//!
//! Every mutation produces a [`Delta`] tagged with its [`Origin`]. Only
//! `Origin::Local` deltas are meant to leave this replica; remote and
//! bulk-loaded state is integrated silently.

use std::collections::HashSet;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, ArrayRef, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::{Sticker, SyncState, Transform};

const FORM_DATA: &str = "formData";
const IMAGES: &str = "images";
const COLORS: &str = "colors";
const TRANSFORMS: &str = "transforms";
const STICKERS: &str = "stickers";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// The delta carried nothing this replica had not already integrated.
    #[error("Delta already applied")]
    MergeNoop,
    #[error("Failed to decode update: {0}")]
    Decode(String),
    #[error("Failed to encode value: {0}")]
    Encode(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// Where a delta came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Produced by a mutation on this replica.
    Local,
    /// Received from a peer.
    Remote,
    /// Bulk-loaded full state. Never re-broadcast.
    Init,
}

/// A serializable unit of change to a [`SharedDocument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub origin: Origin,
    /// yrs v1 update bytes.
    pub update: Vec<u8>,
}

impl Delta {
    pub fn local(update: Vec<u8>) -> Self {
        Self { origin: Origin::Local, update }
    }

    pub fn remote(update: Vec<u8>) -> Self {
        Self { origin: Origin::Remote, update }
    }

    pub fn init(update: Vec<u8>) -> Self {
        Self { origin: Origin::Init, update }
    }

    /// Only locally produced deltas may be sent to peers.
    pub fn is_broadcastable(&self) -> bool {
        self.origin == Origin::Local
    }
}

/// Shared canvas document.
///
/// All methods are synchronous; a mutation is fully applied before the
/// next read observes the document.
pub struct SharedDocument {
    doc: Doc,
    form_data: MapRef,
    images: MapRef,
    colors: MapRef,
    transforms: MapRef,
    stickers: ArrayRef,
    /// Bumped on every change that reaches the document.
    version: u64,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    fn from_doc(doc: Doc) -> Self {
        let form_data = doc.get_or_insert_map(FORM_DATA);
        let images = doc.get_or_insert_map(IMAGES);
        let colors = doc.get_or_insert_map(COLORS);
        let transforms = doc.get_or_insert_map(TRANSFORMS);
        let stickers = doc.get_or_insert_array(STICKERS);
        Self {
            doc,
            form_data,
            images,
            colors,
            transforms,
            stickers,
            version: 0,
        }
    }

    /// Change counter, for re-render decisions.
    pub fn version(&self) -> u64 {
        self.version
    }

    // ─── Local mutations ──────────────────────────────────────────────

    pub fn set_form_field(&mut self, key: &str, value: &str) -> Delta {
        let update = {
            let mut txn = self.doc.transact_mut();
            self.form_data.insert(&mut txn, key, value.to_string());
            txn.encode_update_v1()
        };
        self.version += 1;
        Delta::local(update)
    }

    pub fn remove_form_field(&mut self, key: &str) -> Delta {
        let update = {
            let mut txn = self.doc.transact_mut();
            self.form_data.remove(&mut txn, key);
            txn.encode_update_v1()
        };
        self.version += 1;
        Delta::local(update)
    }

    /// Set or clear (`None`) the image reference for a slot.
    pub fn set_image(&mut self, key: &str, url: Option<&str>) -> Delta {
        let value = match url {
            Some(url) => Any::from(url.to_string()),
            None => Any::Null,
        };
        let update = {
            let mut txn = self.doc.transact_mut();
            self.images.insert(&mut txn, key, value);
            txn.encode_update_v1()
        };
        self.version += 1;
        Delta::local(update)
    }

    pub fn set_color(&mut self, key: &str, color: &str) -> Delta {
        let update = {
            let mut txn = self.doc.transact_mut();
            self.colors.insert(&mut txn, key, color.to_string());
            txn.encode_update_v1()
        };
        self.version += 1;
        Delta::local(update)
    }

    pub fn set_transform(&mut self, slot_id: &str, transform: &Transform) -> Result<Delta, DocumentError> {
        let json = serde_json::to_string(transform)
            .map_err(|e| DocumentError::Encode(e.to_string()))?;
        let update = {
            let mut txn = self.doc.transact_mut();
            self.transforms.insert(&mut txn, slot_id, json);
            txn.encode_update_v1()
        };
        self.version += 1;
        Ok(Delta::local(update))
    }

    pub fn remove_transform(&mut self, slot_id: &str) -> Delta {
        let update = {
            let mut txn = self.doc.transact_mut();
            self.transforms.remove(&mut txn, slot_id);
            txn.encode_update_v1()
        };
        self.version += 1;
        Delta::local(update)
    }

    pub fn add_sticker(&mut self, sticker: &Sticker) -> Result<Delta, DocumentError> {
        let json = serde_json::to_string(sticker)
            .map_err(|e| DocumentError::Encode(e.to_string()))?;
        let update = {
            let mut txn = self.doc.transact_mut();
            self.stickers.push_back(&mut txn, json);
            txn.encode_update_v1()
        };
        self.version += 1;
        Ok(Delta::local(update))
    }

    // ─── Merging ──────────────────────────────────────────────────────

    /// Apply a peer's delta. There is no rejection path: the merge is
    /// convergent, so anything that decodes is integrated.
    ///
    /// Returns `MergeNoop` when the delta changed nothing (already applied,
    /// or still waiting on a causally earlier delta).
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<Delta, DocumentError> {
        self.integrate(update, Origin::Remote)
    }

    /// Bulk-load an encoded full state received from a peer.
    pub fn apply_snapshot(&mut self, update: &[u8]) -> Result<Delta, DocumentError> {
        self.integrate(update, Origin::Init)
    }

    fn integrate(&mut self, update: &[u8], origin: Origin) -> Result<Delta, DocumentError> {
        let decoded = Update::decode_v1(update)?;
        let before_sv = self.doc.transact().state_vector();
        let before = self.sync_state();

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocumentError::Decode(e.to_string()))?;
        }

        let after_sv = self.doc.transact().state_vector();
        // Deletions leave the state vector untouched, so fall back to the
        // flattened view before calling it a no-op.
        if before_sv == after_sv && before == self.sync_state() {
            return Err(DocumentError::MergeNoop);
        }

        self.version += 1;
        Ok(Delta {
            origin,
            update: update.to_vec(),
        })
    }

    /// Bulk-load plain state (e.g. a template's saved values).
    ///
    /// The returned delta is tagged `Init` and must not be broadcast.
    /// Stickers already present (by id) are not appended twice.
    pub fn initialize_state(&mut self, state: &SyncState) -> Result<Delta, DocumentError> {
        let existing: HashSet<String> = self
            .sync_state()
            .stickers
            .into_iter()
            .map(|s| s.id)
            .collect();

        let mut transforms = Vec::with_capacity(state.transforms.len());
        for (slot_id, transform) in &state.transforms {
            let json = serde_json::to_string(transform)
                .map_err(|e| DocumentError::Encode(e.to_string()))?;
            transforms.push((slot_id.as_str(), json));
        }
        let mut stickers = Vec::new();
        for sticker in state.stickers.iter().filter(|s| !existing.contains(&s.id)) {
            let json = serde_json::to_string(sticker)
                .map_err(|e| DocumentError::Encode(e.to_string()))?;
            stickers.push(json);
        }

        let update = {
            let mut txn = self.doc.transact_mut();
            for (key, value) in &state.form_data {
                self.form_data.insert(&mut txn, key.as_str(), value.clone());
            }
            for (key, url) in &state.images {
                let value = match url {
                    Some(url) => Any::from(url.clone()),
                    None => Any::Null,
                };
                self.images.insert(&mut txn, key.as_str(), value);
            }
            for (key, value) in &state.colors {
                self.colors.insert(&mut txn, key.as_str(), value.clone());
            }
            for (slot_id, json) in transforms {
                self.transforms.insert(&mut txn, slot_id, json);
            }
            for json in stickers {
                self.stickers.push_back(&mut txn, json);
            }
            txn.encode_update_v1()
        };
        self.version += 1;
        Ok(Delta::init(update))
    }

    // ─── Snapshots & resync ───────────────────────────────────────────

    /// Flatten into a plain snapshot.
    pub fn sync_state(&self) -> SyncState {
        let txn = self.doc.transact();
        let mut state = SyncState::default();

        for (key, value) in self.form_data.iter(&txn) {
            if let Some(s) = as_string(value) {
                state.form_data.insert(key.to_string(), s);
            }
        }
        for (key, value) in self.images.iter(&txn) {
            state.images.insert(key.to_string(), as_string(value));
        }
        for (key, value) in self.colors.iter(&txn) {
            if let Some(s) = as_string(value) {
                state.colors.insert(key.to_string(), s);
            }
        }
        for (key, value) in self.transforms.iter(&txn) {
            let Some(json) = as_string(value) else { continue };
            match serde_json::from_str::<Transform>(&json) {
                Ok(transform) => {
                    state.transforms.insert(key.to_string(), transform);
                }
                Err(e) => log::warn!("Skipping malformed transform for slot {key}: {e}"),
            }
        }
        for value in self.stickers.iter(&txn) {
            let Some(json) = as_string(value) else { continue };
            match serde_json::from_str::<Sticker>(&json) {
                Ok(sticker) => state.stickers.push(sticker),
                Err(e) => log::warn!("Skipping malformed sticker: {e}"),
            }
        }

        state
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector, sent with resync requests.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica holds that a peer with `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote_sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    /// Whether an update carries no content at all.
    pub fn is_empty_update(update: &[u8]) -> bool {
        update == empty_update()
    }
}

fn empty_update() -> &'static [u8] {
    static EMPTY: OnceLock<Vec<u8>> = OnceLock::new();
    EMPTY.get_or_init(|| {
        let doc = Doc::new();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    })
}

fn as_string(value: Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}
