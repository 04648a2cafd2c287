//! The pluggable key/value store the consensus core persists snapshots,
//! reputation records and committee history through. Thin enough to be
//! backed by `kvdb-memorydb` in tests and any `kvdb::KeyValueDB`
//! implementation (e.g. `kvdb-rocksdb`) in production.

use std::sync::Arc;

use kvdb::{DBTransaction, KeyValueDB};
use thiserror::Error;

/// The single column every subsystem shares; key prefixes keep subsystems
/// from colliding within it.
pub const COLUMN: u32 = 0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage get failed: {0}")]
    Get(String),
    #[error("storage put failed: {0}")]
    Put(String),
}

/// Thin facade over `kvdb::KeyValueDB` used by every persistence-bearing
/// subsystem. Kept deliberately narrow (get/put/delete/iterate-by-prefix) so
/// swapping the backing store never touches subsystem code.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    /// All keys (and values) sharing `prefix`, used to reload bounded
    /// collections like reputation events or committee history at startup.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// Adapter from any `kvdb::KeyValueDB` to our narrower `KvStore`.
pub struct KvDbStore {
    db: Arc<dyn KeyValueDB>,
}

impl KvDbStore {
    pub fn new(db: Arc<dyn KeyValueDB>) -> Self {
        KvDbStore { db }
    }

    /// An in-memory store, used by default and by every test in this crate.
    pub fn in_memory() -> Self {
        KvDbStore::new(Arc::new(kvdb_memorydb::create(1)))
    }
}

impl KvStore for KvDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(COLUMN, key)
            .map_err(|e| StoreError::Get(e.to_string()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut txn = DBTransaction::new();
        txn.put(COLUMN, key, value);
        self.db
            .write(txn)
            .map_err(|e| StoreError::Put(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut txn = DBTransaction::new();
        txn.delete(COLUMN, key);
        self.db
            .write(txn)
            .map_err(|e| StoreError::Put(e.to_string()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.db
            .iter_with_prefix(COLUMN, prefix)
            .map(|r| r.map(|(k, v)| (k.into_vec(), v)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Get(e.to_string()))
    }
}
