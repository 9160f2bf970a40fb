//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: Full CRDT snapshots (LZ4 compressed)
//! - `metadata`: Version, sizes and timestamps (bincode)
//! - `access`: Owner / collaborators / public flag (bincode)
//!
//! A record exists iff its `metadata` entry exists. Snapshot and metadata
//! are always written in one batch.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{unix_now, AccessSource, DocumentAccess, DocumentStore, PersistedDocument, StoreError};
use crate::protocol::DocumentId;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_ACCESS: &str = "access";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_ACCESS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true; flushes are already coalesced)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inkwell_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
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

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: DocumentId,
    /// Incremented by every successful flush
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: DocumentId) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            version: 1,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of metadata (save vs. delete).
    write_lock: Mutex<()>,
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

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
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
            CF_DOCUMENTS => {
                // Values are already LZ4-compressed by us.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA | CF_ACCESS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── CRUD (owned by the document API layer) ──────────────────────

    /// Create an empty document at version 1.
    pub fn create_document(&self, doc_id: &DocumentId) -> Result<DocumentMetadata, StoreError> {
        let _guard = self.lock()?;
        if self.load_metadata(doc_id)?.is_some() {
            return Err(StoreError::AlreadyExists(doc_id.clone()));
        }
        let mut meta = DocumentMetadata::new(doc_id.clone());
        self.write_snapshot(&mut meta, &[])?;
        Ok(meta)
    }

    /// Delete a document, its snapshot and its access record.
    pub fn delete_document(&self, doc_id: &DocumentId) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if self.load_metadata(doc_id)?.is_none() {
            return Err(StoreError::NotFound(doc_id.clone()));
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, doc_id.as_bytes());
        batch.delete_cf(self.cf(CF_ACCESS)?, doc_id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// All document ids, in key order.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(DocumentId::new(id));
        }
        Ok(ids)
    }

    pub fn put_access(&self, doc_id: &DocumentId, access: &DocumentAccess) -> Result<(), StoreError> {
        let cf = self.cf(CF_ACCESS)?;
        self.db
            .put_cf_opt(cf, doc_id.as_bytes(), encode(access)?, &self.write_options())?;
        Ok(())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Write snapshot + metadata atomically, updating sizes and timestamp.
    fn write_snapshot(&self, meta: &mut DocumentMetadata, snapshot: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = meta.doc_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, key, &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, key, encode(meta)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("store write lock poisoned".into()))
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn load(&self, doc_id: &DocumentId) -> Result<PersistedDocument, StoreError> {
        let meta = self
            .load_metadata(doc_id)?
            .ok_or_else(|| StoreError::NotFound(doc_id.clone()))?;

        let content = match self.db.get_cf(self.cf(CF_DOCUMENTS)?, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::Compression(e.to_string()))?,
            None => Vec::new(),
        };

        Ok(PersistedDocument {
            content,
            version: meta.version,
            updated_at: meta.updated_at,
        })
    }

    fn save(&self, doc_id: &DocumentId, content: &[u8], version: u64) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let mut meta = self
            .load_metadata(doc_id)?
            .ok_or_else(|| StoreError::NotFound(doc_id.clone()))?;
        meta.version = version;
        self.write_snapshot(&mut meta, content)
    }
}

impl AccessSource for RocksStore {
    fn load_access(&self, doc_id: &DocumentId) -> Result<Option<DocumentAccess>, StoreError> {
        let cf = self.cf(CF_ACCESS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
