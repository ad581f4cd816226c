use crate::domain::ports::KeyValueStore;
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for primary records (transactions, escrows, receipts, order links).
pub const CF_RECORDS: &str = "records";
/// Column Family for index lists and audit logs.
pub const CF_LISTS: &str = "lists";

/// A persistent store implementation using RocksDB.
///
/// RocksDB has no native compare-and-swap, so every read-modify-write
/// (`compare_and_swap`, `append`, `append_unique`) runs under a process-wide write lock.
/// Plain reads never take the lock.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at `path`, creating the
    /// "records" and "lists" column families if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_records = ColumnFamilyDescriptor::new(CF_RECORDS, Options::default());
        let cf_lists = ColumnFamilyDescriptor::new(CF_LISTS, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_records, cf_lists])?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            SettlementError::Internal(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                name
            ))))
        })
    }

    fn read_list(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        match self.db.get_cf(self.cf(CF_LISTS)?, key)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn write_list(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        let bytes = serde_json::to_vec(values)?;
        self.db.put_cf(self.cf(CF_LISTS)?, key, bytes)?;
        Ok(())
    }

    fn prefix_iter(
        &self,
        cf: &'static str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let handle = self.cf(cf)?;
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.into_vec()).map_err(|e| {
                SettlementError::Internal(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("non UTF-8 key: {}", e),
                )))
            })?;
            entries.push((key, value.into_vec()));
        }
        Ok(entries)
    }
}

#[async_trait]
impl KeyValueStore for RocksDbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(CF_RECORDS)?, key)?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.db.put_cf(self.cf(CF_RECORDS)?, key, value)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let handle = self.cf(CF_RECORDS)?;
        let current = self.db.get_pinned_cf(handle, key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        drop(current);
        self.db.put_cf(handle, key, value)?;
        Ok(true)
    }

    async fn append(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_list(key)?;
        values.push(value);
        self.write_list(key, &values)
    }

    async fn append_unique(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_list(key)?;
        if values.contains(&value) {
            return Ok(false);
        }
        values.push(value);
        self.write_list(key, &values)?;
        Ok(true)
    }

    async fn list(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.read_list(key)
    }

    async fn replace_list(&self, key: &str, values: Vec<Vec<u8>>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_list(key, &values)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.prefix_iter(CF_RECORDS, prefix)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .prefix_iter(CF_LISTS, prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }
}
