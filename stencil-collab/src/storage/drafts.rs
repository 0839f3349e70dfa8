//! RocksDB-backed draft cache.
//!
//! Column families:
//! - `documents` — encoded shared-document state per work
//! - `slots`     — serialized editor slots per work
//! - `metadata`  — [`DraftMetadata`] per work

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use crate::autosave::DraftSink;
use crate::store::StoreError;

const CF_DOCUMENTS: &str = "documents";
const CF_SLOTS: &str = "slots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_SLOTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct DraftCacheConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for DraftCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stencil_drafts"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl DraftCacheConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftMetadata {
    pub work_id: String,
    /// Uncompressed size of the stored document state
    pub document_size: u64,
    /// Uncompressed size of the stored slot JSON
    pub slots_size: u64,
    /// Milliseconds since epoch
    pub updated_at: i64,
}

impl DraftMetadata {
    fn new(work_id: &str) -> Self {
        Self {
            work_id: work_id.to_string(),
            document_size: 0,
            slots_size: 0,
            updated_at: Utc::now().timestamp_millis(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Everything cached for one work.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub document: Option<Vec<u8>>,
    pub slots_json: Option<String>,
    pub metadata: DraftMetadata,
}

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct DraftCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: DraftCacheConfig,
}

impl DraftCache {
    /// Open the cache, creating the database and column families if needed.
    pub fn open(config: DraftCacheConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(backend)?;

        log::debug!("Draft cache opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &DraftCacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        if name == CF_METADATA {
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        opts
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Store the encoded shared-document state for a work.
    pub fn save_document(&self, work_id: &str, state: &[u8]) -> Result<DraftMetadata, StoreError> {
        self.put(CF_DOCUMENTS, work_id, state, |meta, len| meta.document_size = len)
    }

    /// Store the serialized editor slots for a work.
    pub fn save_slots(&self, work_id: &str, slots_json: &str) -> Result<DraftMetadata, StoreError> {
        self.put(CF_SLOTS, work_id, slots_json.as_bytes(), |meta, len| {
            meta.slots_size = len
        })
    }

    fn put(
        &self,
        cf_name: &str,
        work_id: &str,
        value: &[u8],
        record_size: impl FnOnce(&mut DraftMetadata, u64),
    ) -> Result<DraftMetadata, StoreError> {
        let cf_value = self.cf(cf_name)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(value);

        let mut meta = match self.metadata(work_id)? {
            Some(meta) => meta,
            None => DraftMetadata::new(work_id),
        };
        record_size(&mut meta, value.len() as u64);
        meta.updated_at = Utc::now().timestamp_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_value, work_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, work_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(backend)?;

        log::trace!(
            "Cached {cf_name} for {work_id}: {} -> {} bytes",
            value.len(),
            compressed.len()
        );
        Ok(meta)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn metadata(&self, work_id: &str) -> Result<Option<DraftMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, work_id.as_bytes()).map_err(backend)? {
            Some(bytes) => DraftMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn load_document(&self, work_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(CF_DOCUMENTS, work_id)
    }

    pub fn load_slots(&self, work_id: &str) -> Result<Option<String>, StoreError> {
        match self.get(CF_SLOTS, work_id)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Everything cached for `work_id`, or `None` if nothing is.
    pub fn load(&self, work_id: &str) -> Result<Option<Draft>, StoreError> {
        let Some(metadata) = self.metadata(work_id)? else {
            return Ok(None);
        };
        Ok(Some(Draft {
            document: self.load_document(work_id)?,
            slots_json: self.load_slots(work_id)?,
            metadata,
        }))
    }

    fn get(&self, cf_name: &str, work_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, work_id.as_bytes()).map_err(backend)? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    /// Work ids with a cached draft, in key order.
    pub fn list_drafts(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(backend)?;
            let id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    /// Drop everything cached for `work_id`.
    pub fn remove(&self, work_id: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for name in COLUMN_FAMILIES {
            batch.delete_cf(&self.cf(name)?, work_id.as_bytes());
        }
        self.db.write(batch).map_err(backend)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("Column family '{name}' not found")))
    }
}

/// [`DraftSink`] that writes autosaves into a [`DraftCache`] off the
/// async runtime.
#[derive(Clone)]
pub struct CachedDraftSink {
    cache: Arc<DraftCache>,
}

impl CachedDraftSink {
    pub fn new(cache: Arc<DraftCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<DraftCache> {
        &self.cache
    }
}

#[async_trait]
impl DraftSink for CachedDraftSink {
    async fn save_draft(&self, work_id: &str, slots_json: &str) -> Result<(), StoreError> {
        let cache = self.cache.clone();
        let (work_id, slots_json) = (work_id.to_string(), slots_json.to_string());
        tokio::task::spawn_blocking(move || cache.save_slots(&work_id, &slots_json))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_core::SharedDocument;
    use tempfile::TempDir;

    fn open() -> (TempDir, DraftCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DraftCache::open(DraftCacheConfig::for_testing(dir.path().join("drafts"))).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, cache) = open();
        assert!(cache.path().exists());
        assert!(cache.list_drafts().unwrap().is_empty());
    }

    #[test]
    fn test_document_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DraftCacheConfig::for_testing(dir.path().join("drafts"));

        let mut doc = SharedDocument::new();
        doc.set_form_field("title", "Summer trip");
        {
            let cache = DraftCache::open(config.clone()).unwrap();
            let meta = cache.save_document("w1", &doc.encode_state()).unwrap();
            assert_eq!(meta.document_size, doc.encode_state().len() as u64);
        }

        let cache = DraftCache::open(config).unwrap();
        let state = cache.load_document("w1").unwrap().unwrap();
        let mut restored = SharedDocument::new();
        restored.apply_snapshot(&state).unwrap();
        assert_eq!(restored.sync_state().form_data.get("title").map(String::as_str), Some("Summer trip"));
    }

    #[test]
    fn test_slots_and_metadata() {
        let (_dir, cache) = open();
        let json = r#"[{"id":"a","kind":"text"}]"#;
        cache.save_slots("w1", json).unwrap();

        let draft = cache.load("w1").unwrap().unwrap();
        assert_eq!(draft.slots_json.as_deref(), Some(json));
        assert!(draft.document.is_none());
        assert_eq!(draft.metadata.slots_size, json.len() as u64);
        assert_eq!(draft.metadata.document_size, 0);
    }

    #[test]
    fn test_missing_work() {
        let (_dir, cache) = open();
        assert!(cache.load("nope").unwrap().is_none());
        assert!(cache.load_slots("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_and_remove() {
        let (_dir, cache) = open();
        cache.save_slots("b", "[]").unwrap();
        cache.save_slots("a", "[]").unwrap();
        cache.save_document("a", b"state").unwrap();
        assert_eq!(cache.list_drafts().unwrap(), vec!["a".to_string(), "b".to_string()]);

        cache.remove("a").unwrap();
        assert_eq!(cache.list_drafts().unwrap(), vec!["b".to_string()]);
        assert!(cache.load_document("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sink_writes_slots() {
        let (_dir, cache) = open();
        let sink = CachedDraftSink::new(Arc::new(cache));
        sink.save_draft("w9", "[1,2]").await.unwrap();
        assert_eq!(sink.cache().load_slots("w9").unwrap().as_deref(), Some("[1,2]"));
    }
}
