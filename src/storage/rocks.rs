//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots` — LZ4-compressed document payloads, keyed by
//!   `<room_id:16><kind:1>`
//! - `metadata`  — per-snapshot bookkeeping (sizes, timestamp)
//!
//! One row per room and document kind; a flush overwrites the previous
//! snapshot in an atomic batch together with its metadata.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{DocumentKind, SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// fsync every write (flushes are periodic, so default off)
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("roomsync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
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
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub room: Uuid,
    pub kind: DocumentKind,
    pub payload_size: u64,
    pub compressed_size: u64,
    /// Seconds since the epoch, supplied by the snapshot manager.
    pub saved_at: u64,
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable snapshot store over RocksDB.
pub struct RocksSnapshotStore {
    /// Single-threaded mode; callers serialize access through the
    /// snapshot manager.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column families as
    /// needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Payloads are LZ4-compressed by us already.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Read stored metadata for a snapshot, if present.
    pub fn load_metadata(
        &self,
        room: Uuid,
        kind: DocumentKind,
    ) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, Self::key(room, kind))? {
            Some(bytes) => Ok(Some(SnapshotMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop a room's snapshots (both kinds) when the room is deleted.
    pub fn delete_room(&self, room: Uuid) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        for kind in [DocumentKind::Whiteboard, DocumentKind::Notes] {
            let key = Self::key(room, kind);
            batch.delete_cf(&cf_snap, &key);
            batch.delete_cf(&cf_meta, &key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("column family '{name}' not found")))
    }

    /// Key: room id (16 bytes) + document kind (1 byte).
    fn key(room: Uuid, kind: DocumentKind) -> Vec<u8> {
        let mut key = Vec::with_capacity(17);
        key.extend_from_slice(room.as_bytes());
        key.push(kind as u8);
        key
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn save_snapshot(
        &self,
        room: Uuid,
        kind: DocumentKind,
        payload: &[u8],
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(payload);
        let meta = SnapshotMetadata {
            room,
            kind,
            payload_size: payload.len() as u64,
            compressed_size: compressed.len() as u64,
            saved_at: timestamp,
        };

        let key = Self::key(room, kind);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        log::debug!(
            "persisted {kind:?} snapshot for room {room}: {} -> {} bytes",
            meta.payload_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn load_snapshot(
        &self,
        room: Uuid,
        kind: DocumentKind,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, Self::key(room, kind))? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }
}
