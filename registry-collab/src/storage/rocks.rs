//! RocksDB-backed key-value store.
//!
//! Column families, chosen by key prefix:
//! - `locks`   : `document_lock:*` section lock records (small, point lookups)
//! - `versions`: `document_versions:*` saved snapshots (large, LZ4 above threshold)
//! - `entries` : everything else
//!
//! Every value is a bincode [`StoredValue`] envelope carrying its own expiry.
//! Expired entries read as absent and are removed lazily on access, or in bulk
//! by [`RocksStore::purge_expired`].
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::envelope::StoredValue;
use crate::clock::now_millis;
use super::{KeyValueStore, StoreError, LOCK_KEY_PREFIX, VERSION_KEY_PREFIX};

const CF_LOCKS: &str = "locks";
const CF_VERSIONS: &str = "versions";
const CF_ENTRIES: &str = "entries";

const COLUMN_FAMILIES: &[&str] = &[CF_LOCKS, CF_VERSIONS, CF_ENTRIES];

type Db = DBWithThreadMode<SingleThreaded>;

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
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Values at least this large are LZ4-compressed (default: 1KB)
    pub compression_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
            compression_threshold: 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024, // 4MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024, // 2MB
            compression_threshold: 256,
        }
    }
}

/// Durable [`KeyValueStore`].
///
/// All access goes through one mutex so that set-if-absent and
/// compare-and-delete are atomic with respect to each other. RocksDB calls
/// are short point operations, so they run inline on the calling task.
pub struct RocksStore {
    db: Mutex<Db>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
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

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened key-value store at {}", config.path.display());

        Ok(Self {
            db: Mutex::new(db),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_LOCKS => {
                // Tiny, short-lived records
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Payloads are already LZ4 when large
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }

        opts
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let db = self.lock()?;
        let now = now_millis();
        let mut batch = WriteBatch::default();
        let mut purged = 0;

        for name in COLUMN_FAMILIES {
            let cf = cf(&db, name)?;
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (key, raw) = item?;
                let expired = match StoredValue::decode(&raw) {
                    Ok(value) => value.is_expired(now),
                    Err(e) => {
                        log::warn!("Skipping undecodable entry in {name}: {e}");
                        false
                    }
                };
                if expired {
                    batch.delete_cf(cf, &key);
                    purged += 1;
                }
            }
        }

        if purged > 0 {
            db.write_opt(batch, &self.write_options())?;
            log::debug!("Purged {purged} expired entries");
        }
        Ok(purged)
    }

    /// Live keys starting with `prefix`, in key order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let db = self.lock()?;
        let cf = cf(&db, cf_for_key(prefix))?;
        let now = now_millis();
        let mut keys = Vec::new();

        let iter = db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, raw) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if StoredValue::decode(&raw)?.is_expired(now) {
                continue;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        let db = self.lock()?;
        for name in COLUMN_FAMILIES {
            db.flush_cf(cf(&db, name)?)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn lock(&self) -> Result<MutexGuard<'_, Db>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Live envelope under `key`; an expired one is deleted on the way.
    fn read_live(&self, db: &Db, key: &str, now: u64) -> Result<Option<StoredValue>, StoreError> {
        let cf = cf(db, cf_for_key(key))?;
        let Some(raw) = db.get_cf(cf, key.as_bytes())? else {
            return Ok(None);
        };
        let value = StoredValue::decode(&raw)?;
        if value.is_expired(now) {
            db.delete_cf_opt(cf, key.as_bytes(), &self.write_options())?;
            log::trace!("Expired {key}");
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn get_sync(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let db = self.lock()?;
        self.read_live(&db, key, now_millis())?
            .map(|value| value.unwrap_payload())
            .transpose()
    }

    fn set_sync(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool, StoreError> {
        let db = self.lock()?;
        let now = now_millis();
        if if_absent && self.read_live(&db, key, now)?.is_some() {
            return Ok(false);
        }
        let envelope = StoredValue::wrap(value, ttl, now, self.config.compression_threshold);
        let cf = cf(&db, cf_for_key(key))?;
        db.put_cf_opt(cf, key.as_bytes(), envelope.encode()?, &self.write_options())?;
        Ok(true)
    }

    fn set_if_equals_sync(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let db = self.lock()?;
        let now = now_millis();
        let Some(current) = self.read_live(&db, key, now)? else {
            return Ok(false);
        };
        if current.unwrap_payload()? != expected {
            return Ok(false);
        }
        let envelope = StoredValue::wrap(value, ttl, now, self.config.compression_threshold);
        let cf = cf(&db, cf_for_key(key))?;
        db.put_cf_opt(cf, key.as_bytes(), envelope.encode()?, &self.write_options())?;
        Ok(true)
    }

    fn delete_sync(&self, key: &str, expected: Option<&[u8]>) -> Result<bool, StoreError> {
        let db = self.lock()?;
        let Some(current) = self.read_live(&db, key, now_millis())? else {
            return Ok(false);
        };
        if let Some(expected) = expected {
            if current.unwrap_payload()? != expected {
                return Ok(false);
            }
        }
        let cf = cf(&db, cf_for_key(key))?;
        db.delete_cf_opt(cf, key.as_bytes(), &self.write_options())?;
        Ok(true)
    }
}

#[async_trait]
impl KeyValueStore for RocksStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_sync(key)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        if_absent: bool,
    ) -> Result<bool, StoreError> {
        self.set_sync(key, &value, ttl, if_absent)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.delete_sync(key, None)
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.set_if_equals_sync(key, expected, &value, ttl)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        self.delete_sync(key, Some(expected))
    }
}

fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
}

fn cf_for_key(key: &str) -> &'static str {
    if key.starts_with(LOCK_KEY_PREFIX) {
        CF_LOCKS
    } else if key.starts_with(VERSION_KEY_PREFIX) {
        CF_VERSIONS
    } else {
        CF_ENTRIES
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{lock_key, version_key};

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_cf_routing() {
        assert_eq!(cf_for_key(&lock_key("d", 0, 4)), CF_LOCKS);
        assert_eq!(cf_for_key(&version_key("d", "v")), CF_VERSIONS);
        assert_eq!(cf_for_key("misc"), CF_ENTRIES);
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_dir, store) = open_temp();
        assert!(store.set("k", b"v".to_vec(), None, false).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let (_dir, store) = open_temp();
        let key = lock_key("doc", 0, 10);
        assert!(store.set(&key, b"alice".to_vec(), None, true).await.unwrap());
        assert!(!store.set(&key, b"bob".to_vec(), None, true).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(b"alice".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let (_dir, store) = open_temp();
        let key = lock_key("doc", 0, 10);
        store.set(&key, b"alice".to_vec(), None, true).await.unwrap();
        assert!(!store.delete_if_equals(&key, b"bob").await.unwrap());
        assert!(store.delete_if_equals(&key, b"alice").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_equals_refreshes_only_own_value() {
        let (_dir, store) = open_temp();
        let key = lock_key("doc", 0, 10);
        let lease = Some(Duration::from_millis(200));
        assert!(!store.set_if_equals(&key, b"alice", b"alice".to_vec(), lease).await.unwrap());

        store.set(&key, b"alice".to_vec(), lease, true).await.unwrap();
        assert!(!store.set_if_equals(&key, b"bob", b"bob".to_vec(), lease).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(b"alice".to_vec()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.set_if_equals(&key, b"alice", b"alice".to_vec(), lease).await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.get(&key).await.unwrap(), Some(b"alice".to_vec()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!store.set_if_equals(&key, b"alice", b"alice".to_vec(), lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_value_reads_absent() {
        let (_dir, store) = open_temp();
        let key = lock_key("doc", 0, 10);
        store
            .set(&key, b"alice".to_vec(), Some(Duration::from_millis(20)), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get(&key).await.unwrap(), None);
        assert!(store.set(&key, b"bob".to_vec(), None, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_values_roundtrip_compressed() {
        let (_dir, store) = open_temp();
        let body = "the quick brown fox ".repeat(500).into_bytes();
        let key = version_key("doc", "v1");
        store.set(&key, body.clone(), None, false).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(body));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (_dir, store) = open_temp();
        store
            .set("a", b"1".to_vec(), Some(Duration::from_millis(10)), false)
            .await
            .unwrap();
        store
            .set(&version_key("d", "v"), b"2".to_vec(), Some(Duration::from_millis(10)), false)
            .await
            .unwrap();
        store.set("b", b"3".to_vec(), None, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.purge_expired().unwrap(), 2);
        assert_eq!(store.purge_expired().unwrap(), 0);
        assert_eq!(store.get("b").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let (_dir, store) = open_temp();
        for id in ["v1", "v2"] {
            store.set(&version_key("doc", id), vec![1], None, false).await.unwrap();
        }
        store.set(&version_key("other", "v9"), vec![1], None, false).await.unwrap();

        let keys = store.keys_with_prefix("document_versions:doc:").unwrap();
        assert_eq!(
            keys,
            vec![
                "document_versions:doc:v1".to_string(),
                "document_versions:doc:v2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.set("k", b"durable".to_vec(), None, false).await.unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"durable".to_vec()));
        assert!(store.path().exists());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
        assert_eq!(config.compression_threshold, 1024);
    }
}
