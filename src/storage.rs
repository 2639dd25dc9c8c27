//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — LZ4-compressed full document snapshots, keyed by doc id
//! - `meta`      — bincode metadata (clock, sizes, timestamps)
//!
//! One blob per document: the persistence model is full-snapshot, not an
//! update log, so storage stays bounded regardless of edit volume. Both
//! families are written in one atomic batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use crate::persistence::{PersistedSnapshot, PersistenceError, SnapshotStore};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_META: &str = "meta";
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    /// Bloom filter bits per key.
    pub bloom_filter_bits: i32,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codraft_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Metadata kept alongside each snapshot blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    doc_id: Uuid,
    clock: u64,
    raw_size: u64,
    compressed_size: u64,
    updated_at: u64,
}

impl SnapshotMeta {
    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Storage(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable [`SnapshotStore`] over RocksDB.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| PersistenceError::Storage(e.to_string()))?;

        Ok(Self { db })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        // Blobs are pre-compressed with LZ4; skip RocksDB's own pass.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Storage(format!("missing column family {name}")))
    }

    /// Metadata clock for a stored document, if present.
    pub fn clock(&self, doc_id: Uuid) -> Result<Option<u64>, PersistenceError> {
        let meta_cf = self.cf(CF_META)?;
        match self
            .db
            .get_cf(meta_cf, doc_id.as_bytes())
            .map_err(|e| PersistenceError::Storage(e.to_string()))?
        {
            Some(bytes) => Ok(Some(SnapshotMeta::decode(&bytes)?.clock)),
            None => Ok(None),
        }
    }
}

impl SnapshotStore for RocksStore {
    fn get(&self, doc_id: Uuid) -> Result<Option<PersistedSnapshot>, PersistenceError> {
        let snap_cf = self.cf(CF_SNAPSHOTS)?;
        let blob = match self
            .db
            .get_cf(snap_cf, doc_id.as_bytes())
            .map_err(|e| PersistenceError::Storage(e.to_string()))?
        {
            Some(blob) => blob,
            None => return Ok(None),
        };

        let state = lz4_flex::decompress_size_prepended(&blob)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        let clock = self.clock(doc_id)?.unwrap_or(0);
        Ok(Some(PersistedSnapshot { state, clock }))
    }

    fn upsert(&self, doc_id: Uuid, snapshot: &PersistedSnapshot) -> Result<(), PersistenceError> {
        let compressed = lz4_flex::compress_prepend_size(&snapshot.state);
        let meta = SnapshotMeta {
            doc_id,
            clock: snapshot.clock,
            raw_size: snapshot.state.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, doc_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_META)?, doc_id.as_bytes(), meta.encode()?);
        self.db
            .write(batch)
            .map_err(|e| PersistenceError::Storage(e.to_string()))?;

        log::debug!(
            "doc {doc_id}: persisted {} bytes ({} compressed) at clock {}",
            meta.raw_size,
            meta.compressed_size,
            meta.clock
        );
        Ok(())
    }
}
