//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `state`    — exact CRDT state per document (LZ4 compressed)
//! - `blocks`   — readable block projection (JSON array)
//! - `metadata` — per-document bookkeeping (bincode)
//!
//! All keys are the UTF-8 bytes of the document id. A save writes the three
//! families in one atomic batch, so readers never see a projection that
//! disagrees with the state next to it.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{now_millis, PersistedSnapshot, SnapshotStore, StoreError, StoredBlock};
use crate::document::DocumentId;

const CF_STATE: &str = "state";
const CF_BLOCKS: &str = "blocks";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_STATE, CF_BLOCKS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Number of successful saves
    pub save_count: u64,
    /// Uncompressed CRDT state size in bytes (0 for block-only records)
    pub state_size: u64,
    /// Compressed CRDT state size in bytes
    pub compressed_size: u64,
    pub block_count: u64,
    /// Milliseconds since epoch
    pub created_at: u64,
    /// Milliseconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &DocumentId) -> Self {
        let now = now_millis();
        Self {
            doc_id: doc_id.to_string(),
            save_count: 0,
            state_size: 0,
            compressed_size: 0,
            block_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_STATE => {
                // Values are LZ4 already
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BLOCKS => {
                // JSON text compresses well
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Write a block-only record, dropping any CRDT state.
    ///
    /// This is how documents authored outside the sync server enter it: the
    /// next load builds the CRDT content from these blocks.
    pub fn import_blocks(&self, doc_id: &DocumentId, blocks: &[StoredBlock]) -> Result<(), StoreError> {
        let cf_state = self.cf(CF_STATE)?;
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(blocks)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.state_size = 0;
        meta.compressed_size = 0;
        meta.block_count = blocks.len() as u64;
        meta.updated_at = now_millis();

        let key = doc_id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_state, key);
        batch.put_cf(&cf_blocks, key, &json);
        batch.put_cf(&cf_meta, key, meta.encode()?);
        self.write(batch)
    }

    pub fn load_metadata(&self, doc_id: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_str().as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, doc_id: &DocumentId) -> Result<bool, StoreError> {
        Ok(self.load_metadata(doc_id)?.is_some())
    }

    /// All stored document ids.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match std::str::from_utf8(&key) {
                Ok(id) => ids.push(DocumentId::new(id)),
                Err(_) => log::warn!("Skipping non UTF-8 document key ({} bytes)", key.len()),
            }
        }
        Ok(ids)
    }

    /// Delete a document from every column family.
    pub fn delete_document(&self, doc_id: &DocumentId) -> Result<(), StoreError> {
        let key = doc_id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        for name in COLUMN_FAMILIES {
            batch.delete_cf(&self.cf(name)?, key);
        }
        self.write(batch)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self, doc_id: &DocumentId) -> Result<Option<PersistedSnapshot>, StoreError> {
        let key = doc_id.as_str().as_bytes();

        let crdt_state = match self.db.get_cf(&self.cf(CF_STATE)?, key)? {
            Some(compressed) => Some(
                lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?,
            ),
            None => None,
        };

        // The projection is only authoritative when there is no CRDT state.
        let blocks: Vec<StoredBlock> = match self.db.get_cf(&self.cf(CF_BLOCKS)?, key)? {
            Some(json) => match serde_json::from_slice(&json) {
                Ok(blocks) => blocks,
                Err(e) if crdt_state.is_some() => {
                    log::warn!("Unreadable block projection for {doc_id}, keeping CRDT state: {e}");
                    Vec::new()
                }
                Err(e) => return Err(StoreError::DeserializationError(e.to_string())),
            },
            None => Vec::new(),
        };

        let meta = self.load_metadata(doc_id)?;
        if crdt_state.is_none() && blocks.is_empty() && meta.is_none() {
            return Ok(None);
        }

        Ok(Some(PersistedSnapshot {
            blocks,
            crdt_state,
            updated_at: meta.map_or(0, |m| m.updated_at),
        }))
    }

    fn save(&self, doc_id: &DocumentId, snapshot: &PersistedSnapshot) -> Result<(), StoreError> {
        let cf_state = self.cf(CF_STATE)?;
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = doc_id.as_str().as_bytes();

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.save_count += 1;
        meta.block_count = snapshot.blocks.len() as u64;
        meta.updated_at = snapshot.updated_at;

        let mut batch = WriteBatch::default();
        match &snapshot.crdt_state {
            Some(state) => {
                let compressed = lz4_flex::compress_prepend_size(state);
                meta.state_size = state.len() as u64;
                meta.compressed_size = compressed.len() as u64;
                batch.put_cf(&cf_state, key, &compressed);
            }
            None => {
                meta.state_size = 0;
                meta.compressed_size = 0;
                batch.delete_cf(&cf_state, key);
            }
        }

        let json = serde_json::to_vec(&snapshot.blocks)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        batch.put_cf(&cf_blocks, key, &json);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        self.write(batch)
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
