//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `snapshots` - committed `DocSnapshot`s, JSON then LZ4, keyed by name
//! - `ops`       - op log, JSON then LZ4, keyed by `name \0 version`
//! - `metadata`  - `DocumentRecord` (bincode), keyed by name
//!
//! Names never contain `\0` (see [`crate::doc::valid_name`]), so the op key
//! prefix of one document never collides with another's, and big-endian
//! versions keep each document's log sorted.
//!
//! Reference: Kleppmann - DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{DocumentStore, StoreError};
use crate::doc::{DocSnapshot, OpData};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPS: &str = "ops";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
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
    /// Small caches, given directory.
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
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Version of the committed snapshot
    pub committed_version: u64,
    /// Number of ops in the log
    pub op_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentRecord {
    fn new() -> Self {
        let now = unix_secs();
        Self {
            committed_version: 0,
            op_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(record)
    }
}

/// RocksDB-backed [`DocumentStore`].
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
            CF_SNAPSHOTS => {
                // Values are LZ4 already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Bookkeeping record for `name`.
    pub fn record(&self, name: &str) -> Result<DocumentRecord, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => DocumentRecord::decode(&bytes),
            None => Err(StoreError::NotFound(name.to_string())),
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

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// `name \0` - every op key of a document starts with this.
    fn op_prefix(name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(name.len() + 9);
        key.extend_from_slice(name.as_bytes());
        key.push(0);
        key
    }

    fn op_key(name: &str, version: u64) -> Vec<u8> {
        let mut key = Self::op_prefix(name);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn encode_snapshot(data: &DocSnapshot) -> Result<(Vec<u8>, usize), StoreError> {
        let json = serde_json::to_vec(data)?;
        Ok((lz4_flex::compress_prepend_size(&json), json.len()))
    }

    fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Every op key of `name`, in version order.
    fn op_keys(&self, name: &str) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let prefix = Self::op_prefix(name);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn put_record(&self, batch: &mut WriteBatch, name: &str, record: &DocumentRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        batch.put_cf(cf, name.as_bytes(), record.encode()?);
        Ok(())
    }
}

impl DocumentStore for RocksStore {
    fn create(&self, name: &str, data: &DocSnapshot) -> Result<(), StoreError> {
        if self.record(name).is_ok() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let (compressed, raw_len) = Self::encode_snapshot(data)?;
        let mut record = DocumentRecord::new();
        record.committed_version = data.v;
        record.snapshot_size = raw_len as u64;
        record.compressed_size = compressed.len() as u64;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, name.as_bytes(), &compressed);
        self.put_record(&mut batch, name, &record)?;
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn get_snapshot(&self, name: &str) -> Result<DocSnapshot, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => Self::decode_value(&bytes),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    fn write_snapshot(&self, name: &str, data: &DocSnapshot) -> Result<(), StoreError> {
        let mut record = self.record(name)?;
        let (compressed, raw_len) = Self::encode_snapshot(data)?;
        record.committed_version = data.v;
        record.snapshot_size = raw_len as u64;
        record.compressed_size = compressed.len() as u64;
        record.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, name.as_bytes(), &compressed);
        self.put_record(&mut batch, name, &record)?;
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn write_op(&self, name: &str, op: &OpData) -> Result<(), StoreError> {
        let mut record = self.record(name)?;
        record.op_count += 1;
        record.updated_at = unix_secs();

        let value = lz4_flex::compress_prepend_size(&serde_json::to_vec(op)?);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_OPS)?, Self::op_key(name, op.v), &value);
        self.put_record(&mut batch, name, &record)?;
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn get_ops(&self, name: &str, start: u64, end: Option<u64>) -> Result<Vec<OpData>, StoreError> {
        if self.record(name).is_err() {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let cf = self.cf(CF_OPS)?;
        let prefix = Self::op_prefix(name);
        let start_key = Self::op_key(name, start);
        let end_key = end.map(|end| Self::op_key(name, end));

        let mut ops = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if end_key.as_ref().is_some_and(|end| key.as_ref() >= end.as_slice()) {
                break;
            }
            ops.push(Self::decode_value(&value)?);
        }

        Ok(ops)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.record(name)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, name.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, name.as_bytes());
        let cf_ops = self.cf(CF_OPS)?;
        for key in self.op_keys(name)? {
            batch.delete_cf(cf_ops, &key);
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Serialization("Invalid document name key".into()))?;
            names.push(name);
        }
        Ok(names)
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
