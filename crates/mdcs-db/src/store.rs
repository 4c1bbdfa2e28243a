//! The public key-value API of one namespace.
//!
//! A [`Store`] turns writes into deltas, hands them to the merge engine and
//! reads the materialized records back. It is cheap to clone; clones share
//! the same engine.

use crate::config::StoreConfig;
use crate::datastore::Datastore;
use crate::error::{DbError, Result};
use crate::merge::{MergeEngine, MergeOutcome};
use mdcs_core::Key;
use mdcs_delta::{DataFilter, Delta, Element, Tombstone};
use mdcs_merkle::{Broadcaster, Cid, DagService, MerkleNode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One write in a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put(Key, Vec<u8>),
    Delete(Key),
}

/// Several writes published as a single delta.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(WriteOp::Put(key.into(), value.into()));
        self
    }

    pub fn delete(mut self, key: impl Into<Key>) -> Self {
        self.ops.push(WriteOp::Delete(key.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Snapshot of a store's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub namespace: Key,
    pub heads: usize,
    pub max_height: u64,
    pub pending: usize,
    pub filters: usize,
}

/// A replicated key-value store scoped to one namespace.
pub struct Store<D: Datastore, G: DagService, B: Broadcaster> {
    engine: Arc<MergeEngine<D, G, B>>,
}

impl<D: Datastore, G: DagService, B: Broadcaster> Clone for Store<D, G, B> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<D: Datastore, G: DagService, B: Broadcaster> Store<D, G, B> {
    /// Open a store with an empty data filter.
    pub fn new(
        namespace: impl Into<Key>,
        datastore: Arc<D>,
        dag: Arc<G>,
        broadcaster: Arc<B>,
        config: StoreConfig,
    ) -> Self {
        let filter = Arc::new(DataFilter::new(config.accept_by_default));
        Self::with_filter(namespace, datastore, dag, broadcaster, filter, config)
    }

    /// Open a store sharing an existing data filter.
    pub fn with_filter(
        namespace: impl Into<Key>,
        datastore: Arc<D>,
        dag: Arc<G>,
        broadcaster: Arc<B>,
        filter: Arc<DataFilter>,
        config: StoreConfig,
    ) -> Self {
        let namespace = namespace.into();
        info!(namespace = %namespace, replica = %config.replica_id, "opening store");
        Self {
            engine: Arc::new(MergeEngine::new(
                namespace,
                datastore,
                dag,
                broadcaster,
                filter,
                config,
            )),
        }
    }

    pub fn namespace(&self) -> &Key {
        self.engine.namespace()
    }

    pub fn config(&self) -> &StoreConfig {
        self.engine.config()
    }

    pub fn filter(&self) -> &Arc<DataFilter> {
        self.engine.filter()
    }

    pub fn engine(&self) -> &MergeEngine<D, G, B> {
        &self.engine
    }

    /// Write `value` at `key`.
    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Result<Cid> {
        let key = key.into();
        self.engine.record_key(&key)?;

        let mut delta = Delta::new();
        delta.add_element(Element::new(key.as_str(), value));
        Ok(self.engine.merge_local(delta).await?.cid)
    }

    /// The live value at `key`.
    pub fn get(&self, key: impl Into<Key>) -> Result<Vec<u8>> {
        let key = key.into();
        match self.engine.record(&key)? {
            Some(record) => record
                .value
                .ok_or_else(|| DbError::NotFound(key.to_string())),
            None => Err(DbError::NotFound(key.to_string())),
        }
    }

    pub fn has(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        Ok(self
            .engine
            .record(&key)?
            .map(|record| !record.is_tombstone())
            .unwrap_or(false))
    }

    /// Delete the live value at `key`.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<Cid> {
        let key = key.into();
        let tombstone = self
            .tombstone_for(&key)?
            .ok_or_else(|| DbError::NotFound(key.to_string()))?;

        let mut delta = Delta::new();
        delta.add_tombstone(tombstone);
        Ok(self.engine.merge_local(delta).await?.cid)
    }

    /// Publish several writes as one delta. Deletes of absent keys are
    /// skipped; a batch left with nothing to write fails with `NotFound`,
    /// and an empty batch with `UnsupportedOperation`.
    pub async fn put_batch(&self, batch: WriteBatch) -> Result<Cid> {
        let requested = batch.len();
        let mut delta = Delta::new();
        for op in batch.ops {
            match op {
                WriteOp::Put(key, value) => {
                    self.engine.record_key(&key)?;
                    delta.add_element(Element::new(key.as_str(), value));
                }
                WriteOp::Delete(key) => {
                    if let Some(tombstone) = self.tombstone_for(&key)? {
                        delta.add_tombstone(tombstone);
                    }
                }
            }
        }
        if delta.is_empty() && requested > 0 {
            return Err(DbError::NotFound(format!(
                "all {} deletes in the batch target absent keys",
                requested
            )));
        }
        Ok(self.engine.merge_local(delta).await?.cid)
    }

    /// Live entries strictly below `prefix`, in key order.
    pub fn query(&self, prefix: impl Into<Key>) -> Result<Vec<(Key, Vec<u8>)>> {
        Ok(self
            .engine
            .records(&prefix.into())?
            .into_iter()
            .filter_map(|(key, record)| record.value.map(|value| (key, value)))
            .collect())
    }

    /// Current heads sorted by CID, and the maximum head height.
    pub fn heads(&self) -> Result<(Vec<Cid>, u64)> {
        self.engine.heads().list()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (heads, max_height) = self.engine.heads().list()?;
        Ok(StoreStats {
            namespace: self.namespace().clone(),
            heads: heads.len(),
            max_height,
            pending: self.engine.pending().len(),
            filters: self.filter().element_filter_count(),
        })
    }

    /// Retry nodes whose application failed earlier and announce local
    /// nodes whose broadcast failed.
    pub async fn repair(&self) -> Result<usize> {
        self.engine.repair().await
    }

    /// Merge an encoded node received from a peer.
    pub async fn handle_remote(&self, bytes: &[u8]) -> Result<Vec<MergeOutcome>> {
        let node = MerkleNode::decode(bytes)?;
        self.engine.merge_remote(node).await
    }

    /// Merge every payload from `receiver` until the channel closes.
    /// Returns the number of nodes merged.
    pub async fn run(&self, mut receiver: mpsc::Receiver<Vec<u8>>) -> usize {
        let mut merged = 0;
        while let Some(bytes) = receiver.recv().await {
            match self.handle_remote(&bytes).await {
                Ok(outcomes) => merged += outcomes.len(),
                Err(e) => {
                    warn!(namespace = %self.namespace(), error = %e, "failed to merge remote delta")
                }
            }
        }
        debug!(namespace = %self.namespace(), merged, "inbound channel closed");
        merged
    }

    fn tombstone_for(&self, key: &Key) -> Result<Option<Tombstone>> {
        Ok(self
            .engine
            .record(key)?
            .filter(|record| !record.is_tombstone())
            .map(|record| Tombstone::new(key.as_str(), record.stamp)))
    }
}

impl<D, G, B> Store<D, G, B>
where
    D: Datastore + 'static,
    G: DagService + 'static,
    B: Broadcaster + 'static,
{
    /// Subscribe to the namespace topic and merge incoming nodes on a
    /// background task.
    pub async fn subscribe(&self) -> Result<JoinHandle<usize>> {
        let receiver = self
            .engine
            .broadcaster()
            .subscribe(self.engine.topic())
            .await?;
        let store = self.clone();
        Ok(tokio::spawn(async move { store.run(receiver).await }))
    }
}
