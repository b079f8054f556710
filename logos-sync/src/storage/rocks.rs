//! RocksDB-backed storage backend.
//!
//! One column family per namespace:
//! - `SCENES` — encrypted scene snapshots keyed by room id
//! - `ROOMS`  — room registry (value: creation time, ms since epoch, BE)
//! - `FILES`  — encrypted attachments keyed by `files/rooms/<room>/<file>`
//!
//! Values are already compressed and encrypted by the layers above, so the
//! column families for scenes and files skip RocksDB compression.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};

use super::{Namespace, StorageBackend, StoreError};

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
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

/// Durable key-value store for scenes, rooms and files.
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

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Namespace::ALL
            .iter()
            .map(|ns| ColumnFamilyDescriptor::new(ns.as_str(), Self::cf_options(*ns, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened storage at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(namespace: Namespace, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match namespace {
            Namespace::Scenes | Namespace::Files => {
                // Ciphertext does not compress
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            Namespace::Rooms => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    pub fn get_sync(&self, key: &str, namespace: Namespace) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(namespace)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    pub fn set_sync(&self, key: &str, value: &[u8], namespace: Namespace) -> Result<(), StoreError> {
        let cf = self.cf(namespace)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, key.as_bytes(), value, &write_opts)?;
        Ok(())
    }

    pub fn keys_sync(&self, namespace: Namespace) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(namespace)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Force a flush of the memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, namespace: Namespace) -> Result<&rocksdb::ColumnFamily, StoreError> {
        let name = namespace.as_str();
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl StorageBackend for RocksStore {
    async fn get(&self, key: &str, namespace: Namespace) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_sync(key, namespace)
    }

    async fn set(&self, key: &str, value: Vec<u8>, namespace: Namespace) -> Result<(), StoreError> {
        self.set_sync(key, &value, namespace)
    }

    async fn has(&self, key: &str, namespace: Namespace) -> Result<bool, StoreError> {
        Ok(self.get_sync(key, namespace)?.is_some_and(|v| !v.is_empty()))
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StoreError> {
        self.keys_sync(namespace)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
