//! The head index.
//!
//! Heads are the DAG nodes no other processed node points to. Each head is
//! stored at `<namespace>/<cid>` with its height as 8 little-endian bytes.
//! The index keeps a process-local cache primed from the datastore on first
//! use; the datastore stays the source of truth and every mutation writes
//! through it before the cache is touched.
//!
//! Callers serialize mutations; the index itself only guards its cache.

use crate::datastore::{Batch, Datastore};
use crate::error::{DbError, Result};
use mdcs_core::Key;
use mdcs_merkle::Cid;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Current heads of one namespace.
pub struct HeadIndex<D: Datastore> {
    namespace: Key,
    store: Arc<D>,
    cache: RwLock<Option<HashMap<Cid, u64>>>,
}

impl<D: Datastore> HeadIndex<D> {
    /// An index whose entries live directly below `namespace`.
    pub fn new(store: Arc<D>, namespace: Key) -> Self {
        Self {
            namespace,
            store,
            cache: RwLock::new(None),
        }
    }

    pub fn namespace(&self) -> &Key {
        &self.namespace
    }

    /// Datastore key of the entry for `cid`.
    pub fn get_key(&self, cid: &Cid) -> Key {
        self.namespace.child_string(cid.to_hex())
    }

    /// Record `cid` as a head. Adding an existing head is a no-op.
    pub fn add(&self, cid: Cid, height: u64) -> Result<()> {
        if self.is_head(&cid)? {
            return Ok(());
        }
        self.store
            .put(&self.get_key(&cid), height.to_le_bytes().to_vec())?;
        self.with_cache_mut(|heads| {
            heads.insert(cid, height);
        })?;
        debug!(namespace = %self.namespace, cid = %cid.short(), height, "head added");
        Ok(())
    }

    pub fn is_head(&self, cid: &Cid) -> Result<bool> {
        self.with_cache(|heads| heads.contains_key(cid))
    }

    pub fn get_head_height(&self, cid: &Cid) -> Result<u64> {
        self.with_cache(|heads| heads.get(cid).copied())?
            .ok_or_else(|| DbError::NotFound(format!("head {}", cid)))
    }

    /// Swap `old` for `new` in one datastore batch.
    pub fn replace(&self, old: &Cid, new: Cid, height: u64) -> Result<()> {
        let mut batch = Batch::new();
        if *old != new {
            batch.delete(self.get_key(old));
        }
        batch.put(self.get_key(&new), height.to_le_bytes().to_vec());
        self.store.write_batch(batch)?;

        self.with_cache_mut(|heads| {
            heads.remove(old);
            heads.insert(new, height);
        })?;
        debug!(
            namespace = %self.namespace,
            old = %old.short(),
            new = %new.short(),
            height,
            "head replaced"
        );
        Ok(())
    }

    /// Drop `cid` from the heads. Removing a non-head is a no-op.
    pub fn remove(&self, cid: &Cid) -> Result<()> {
        if !self.is_head(cid)? {
            return Ok(());
        }
        self.store.delete(&self.get_key(cid))?;
        self.with_cache_mut(|heads| {
            heads.remove(cid);
        })?;
        debug!(namespace = %self.namespace, cid = %cid.short(), "head removed");
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        self.with_cache(HashMap::len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with_cache(HashMap::is_empty)
    }

    /// All heads sorted by CID, plus the maximum height among them
    /// (0 when there are none).
    pub fn list(&self) -> Result<(Vec<Cid>, u64)> {
        self.with_cache(|heads| {
            let mut cids: Vec<Cid> = heads.keys().copied().collect();
            cids.sort();
            let max_height = heads.values().copied().max().unwrap_or(0);
            (cids, max_height)
        })
    }

    /// Forget the cache; the next call re-reads the datastore.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    fn with_cache<R>(&self, f: impl FnOnce(&HashMap<Cid, u64>) -> R) -> Result<R> {
        if let Some(heads) = self.cache.read().as_ref() {
            return Ok(f(heads));
        }
        let mut cache = self.cache.write();
        if cache.is_none() {
            *cache = Some(self.load()?);
        }
        match cache.as_ref() {
            Some(heads) => Ok(f(heads)),
            None => Err(DbError::Storage("head cache not primed".to_string())),
        }
    }

    fn with_cache_mut(&self, f: impl FnOnce(&mut HashMap<Cid, u64>)) -> Result<()> {
        let mut cache = self.cache.write();
        if cache.is_none() {
            *cache = Some(self.load()?);
        }
        if let Some(heads) = cache.as_mut() {
            f(heads);
        }
        Ok(())
    }

    fn load(&self) -> Result<HashMap<Cid, u64>> {
        let mut heads = HashMap::new();
        for (key, value) in self.store.scan_prefix(&self.namespace)? {
            let cid: Cid = key
                .name()
                .parse()
                .map_err(|e| DbError::Codec(format!("bad head key {}: {}", key, e)))?;
            let bytes: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| DbError::Codec(format!("bad head height at {}", key)))?;
            heads.insert(cid, u64::from_le_bytes(bytes));
        }
        debug!(namespace = %self.namespace, heads = heads.len(), "head cache primed");
        Ok(heads)
    }
}
