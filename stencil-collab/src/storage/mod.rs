//! Local draft cache.
//!
//! ```text
//! ┌──────────────────┐  save_draft   ┌────────────────────────────────────┐
//! │ AutosaveScheduler│ ────────────► │ DraftCache (RocksDB)               │
//! └──────────────────┘               │ CF "documents" — CRDT snapshots    │
//! ┌──────────────────┐  snapshots    │ CF "slots"     — editor slot JSON  │
//! │ SharedDocument   │ ────────────► │ CF "metadata"  — sizes, timestamps │
//! └──────────────────┘               └────────────────────────────────────┘
//! ```
//!
//! Values are LZ4 compressed with the uncompressed size prepended.
//! Metadata is bincode encoded.

pub mod drafts;

pub use drafts::{CachedDraftSink, Draft, DraftCache, DraftCacheConfig, DraftMetadata};
