//! The backing datastore.
//!
//! The store materializes records, heads and processed markers into a plain
//! ordered key-value map. [`MemoryDatastore`] keeps it in a `BTreeMap`;
//! [`SledDatastore`] persists it with sled.

use crate::error::{DbError, Result};
use mdcs_core::Key;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One write in a [`Batch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put(Key, Vec<u8>),
    Delete(Key),
}

/// Writes applied atomically by [`Datastore::write_batch`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Key, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Key) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

impl IntoIterator for Batch {
    type Item = BatchOp;
    type IntoIter = std::vec::IntoIter<BatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// Ordered key-value storage.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<()>;

    /// Deleting an absent key is not an error.
    fn delete(&self, key: &Key) -> Result<()>;

    fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Every entry strictly below `prefix`, in key order.
    fn scan_prefix(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>>;

    /// Apply all writes of `batch` or none of them.
    fn write_batch(&self, batch: Batch) -> Result<()>;
}

impl<T: Datastore + ?Sized> Datastore for Arc<T> {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &Key) -> Result<()> {
        (**self).delete(key)
    }

    fn has(&self, key: &Key) -> Result<bool> {
        (**self).has(key)
    }

    fn scan_prefix(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        (**self).scan_prefix(prefix)
    }

    fn write_batch(&self, batch: Batch) -> Result<()> {
        (**self).write_batch(batch)
    }
}

/// String form under which descendants of `prefix` start.
fn scan_start(prefix: &Key) -> String {
    if prefix.is_root() {
        prefix.as_str().to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// In-memory datastore.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `DbError::Storage`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(DbError::Storage("memory datastore rejects writes".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key.as_str()).cloned())
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.entries.write().insert(key.as_str().to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<()> {
        self.check_writable()?;
        self.entries.write().remove(key.as_str());
        Ok(())
    }

    fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.entries.read().contains_key(key.as_str()))
    }

    fn scan_prefix(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let start = scan_start(prefix);
        let entries = self.entries.read();
        Ok(entries
            .range::<str, _>((Bound::Included(start.as_str()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&start))
            .filter(|(k, _)| k.as_str() != start)
            .map(|(k, v)| (Key::new(k), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: Batch) -> Result<()> {
        self.check_writable()?;
        let mut entries = self.entries.write();
        for op in batch {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key.as_str().to_string(), value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(key.as_str());
                }
            }
        }
        Ok(())
    }
}

/// Sled-backed datastore.
pub struct SledDatastore {
    db: sled::Db,
}

impl SledDatastore {
    /// Open (or create) a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| DbError::Storage(format!("Failed to open sled database: {}", e)))?;
        Ok(Self { db })
    }

    /// A database that is removed when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// The underlying sled database.
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Datastore for SledDatastore {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_str().as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &Key, value: Vec<u8>) -> Result<()> {
        self.db.insert(key.as_str().as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<()> {
        self.db.remove(key.as_str().as_bytes())?;
        Ok(())
    }

    fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.db.contains_key(key.as_str().as_bytes())?)
    }

    fn scan_prefix(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let start = scan_start(prefix);
        let mut result = Vec::new();
        for item in self.db.scan_prefix(start.as_bytes()) {
            let (key, value) = item?;
            let key = std::str::from_utf8(&key)
                .map_err(|e| DbError::Storage(format!("Non UTF-8 key in sled: {}", e)))?;
            if key == start {
                continue;
            }
            result.push((Key::new(key), value.to_vec()));
        }
        Ok(result)
    }

    fn write_batch(&self, batch: Batch) -> Result<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch {
            match op {
                BatchOp::Put(key, value) => sled_batch.insert(key.as_str().as_bytes(), value),
                BatchOp::Delete(key) => sled_batch.remove(key.as_str().as_bytes()),
            }
        }
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Datastore) {
        store.put(&Key::new("/ns/a"), b"1".to_vec()).unwrap();
        store.put(&Key::new("/ns/a/b"), b"2".to_vec()).unwrap();
        store.put(&Key::new("/ns/ab"), b"3".to_vec()).unwrap();
        store.put(&Key::new("/other"), b"4".to_vec()).unwrap();

        assert_eq!(store.get(&Key::new("/ns/a")).unwrap(), Some(b"1".to_vec()));
        assert!(store.has(&Key::new("/ns/ab")).unwrap());
        assert!(!store.has(&Key::new("/ns/zz")).unwrap());

        let below_a: Vec<Key> = store
            .scan_prefix(&Key::new("/ns/a"))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(below_a, vec![Key::new("/ns/a/b")]);

        let below_ns = store.scan_prefix(&Key::new("/ns")).unwrap();
        assert_eq!(below_ns.len(), 3);
        assert_eq!(store.scan_prefix(&Key::root()).unwrap().len(), 4);

        let mut batch = Batch::new();
        batch.delete(Key::new("/ns/a"));
        batch.put(Key::new("/ns/c"), b"5".to_vec());
        store.write_batch(batch).unwrap();
        assert!(!store.has(&Key::new("/ns/a")).unwrap());
        assert_eq!(store.get(&Key::new("/ns/c")).unwrap(), Some(b"5".to_vec()));

        store.delete(&Key::new("/missing")).unwrap();
    }

    #[test]
    fn test_memory_datastore() {
        exercise(&MemoryDatastore::new());
    }

    #[test]
    fn test_sled_datastore() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledDatastore::open(dir.path().join("db")).unwrap();
        exercise(&store);
        store.flush().unwrap();
    }

    #[test]
    fn test_sled_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = SledDatastore::open(&path).unwrap();
            store.put(&Key::new("/ns/k"), b"v".to_vec()).unwrap();
            store.flush().unwrap();
        }
        let store = SledDatastore::open(&path).unwrap();
        assert_eq!(store.get(&Key::new("/ns/k")).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_failed_batch_writes_nothing() {
        let store = MemoryDatastore::new();
        store.set_fail_writes(true);

        let mut batch = Batch::new();
        batch.put(Key::new("/a"), vec![1]);
        assert!(matches!(store.write_batch(batch), Err(DbError::Storage(_))));
        assert!(store.is_empty());
    }
}
