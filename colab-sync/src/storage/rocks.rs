//! RocksDB-backed pending store.
//!
//! Column families:
//! - `pending`: one [`PendingRecord`] per document, keyed by document name
//!   (bincode, then LZ4 compressed)
//!
//! Records are small and rewritten whole on every local edit, so the column
//! family is tuned for point lookups and short-lived values.

use super::{PendingRecord, PendingStore};
use crate::error::SyncError;
use crate::protocol::DocumentName;
use log::{debug, warn};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

const CF_PENDING: &str = "pending";

/// Pending store configuration.
#[derive(Debug, Clone)]
pub struct PendingStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: true; a lost pending record is a lost edit)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
    /// Write buffer size (default: 4MB)
    pub write_buffer_size: usize,
}

impl Default for PendingStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("colab_pending"),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl PendingStoreConfig {
    /// Config for testing (tiny caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 16,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Durable pending store on RocksDB.
pub struct RocksPendingStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: PendingStoreConfig,
}

impl RocksPendingStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: PendingStoreConfig) -> Result<Self, SyncError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let descriptor = ColumnFamilyDescriptor::new(CF_PENDING, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![descriptor],
        )?;

        debug!("Opened pending store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &PendingStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Names of all documents that currently hold a pending record.
    pub fn documents_with_pending(&self) -> Result<Vec<DocumentName>, SyncError> {
        let cf = self.cf()?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            match std::str::from_utf8(&key) {
                Ok(name) => names.push(DocumentName::new(name)),
                Err(_) => warn!("Skipping pending record with non-UTF-8 key"),
            }
        }
        Ok(names)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, SyncError> {
        self.db
            .cf_handle(CF_PENDING)
            .ok_or_else(|| SyncError::Storage(format!("Column family '{CF_PENDING}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl PendingStore for RocksPendingStore {
    fn save_pending(&self, document: &DocumentName, blobs: &[Vec<u8>]) -> Result<(), SyncError> {
        let cf = self.cf()?;
        let record = PendingRecord::new(document, blobs);
        let compressed = lz4_flex::compress_prepend_size(&record.encode()?);
        self.db
            .put_cf_opt(cf, document.as_str().as_bytes(), &compressed, &self.write_options())?;
        Ok(())
    }

    fn load_pending(&self, document: &DocumentName) -> Result<Vec<Vec<u8>>, SyncError> {
        let cf = self.cf()?;
        let Some(compressed) = self.db.get_cf(cf, document.as_str().as_bytes())? else {
            return Ok(Vec::new());
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|_| SyncError::Corrupted { document: document.clone() })?;
        Ok(PendingRecord::decode(document, &bytes)?.blobs)
    }

    fn clear_pending(&self, document: &DocumentName) -> Result<(), SyncError> {
        let cf = self.cf()?;
        self.db
            .delete_cf_opt(cf, document.as_str().as_bytes(), &self.write_options())?;
        Ok(())
    }
}
