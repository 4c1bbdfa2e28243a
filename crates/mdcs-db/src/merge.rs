//! The merge engine.
//!
//! Every delta, whether authored here or received from a peer, goes through
//! the same state machine:
//!
//! ```text
//! Filtering -> Persisting -> Applying -> UpdatingHeads -> [Broadcasting] -> Done
//!                  \______________\____________\________________\-> Failed
//! ```
//!
//! Record application is a lattice join, so it is safe to repeat and to run
//! in any order. Head mutations are serialized per namespace by the writer
//! lock, and a node is marked processed only after its heads are updated.
//! A node whose application failed stays in the DAG, unprocessed, and is
//! retried by [`MergeEngine::repair`].
//!
//! A locally authored node is announced once it is in the DAG, even when
//! applying it here failed. A failed announcement is retried by `repair`.
//!
//! Peers are untrusted: a remote node must sit exactly one above its
//! highest parent (0 for a root), and its elements must carry that height
//! as their priority.

use crate::config::StoreConfig;
use crate::datastore::{Batch, Datastore};
use crate::error::{DbError, Result};
use crate::heads::HeadIndex;
use mdcs_core::{Key, Lattice, Record};
use mdcs_delta::{DataFilter, Delta};
use mdcs_merkle::{Broadcaster, Cid, DagError, DagService, DagSyncer, MerkleNode, NodeBuilder, SyncConfig};
use parking_lot::{Mutex, MutexGuard};
use std::collections::btree_map::Entry;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Segment under the namespace holding the head index.
pub const HEADS_SEGMENT: &str = "heads";

/// Segment under the namespace holding processed-node markers.
pub const PROCESSED_SEGMENT: &str = "processed";

/// Stage of a single merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeState {
    Filtering,
    Persisting,
    Applying,
    UpdatingHeads,
    Broadcasting,
    Done,
    Failed,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeState::Filtering => "filtering",
            MergeState::Persisting => "persisting",
            MergeState::Applying => "applying",
            MergeState::UpdatingHeads => "updating_heads",
            MergeState::Broadcasting => "broadcasting",
            MergeState::Done => "done",
            MergeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of merging one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub cid: Cid,
    pub height: u64,
    /// Tombstones added by the data filter.
    pub filtered: usize,
    /// Records whose stored state changed.
    pub changed: usize,
    pub state: MergeState,
}

/// Striped locks over record keys.
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the stripes of all `keys`, always in ascending stripe order.
    fn lock<'a, 'k>(&'a self, keys: impl IntoIterator<Item = &'k Key>) -> Vec<MutexGuard<'a, ()>> {
        let indices: BTreeSet<usize> = keys
            .into_iter()
            .map(|key| {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.stripes.len() as u64) as usize
            })
            .collect();
        indices.into_iter().map(|i| self.stripes[i].lock()).collect()
    }
}

/// Merges deltas into one namespace.
pub struct MergeEngine<D: Datastore, G: DagService, B: Broadcaster> {
    namespace: Key,
    datastore: Arc<D>,
    heads: HeadIndex<D>,
    filter: Arc<DataFilter>,
    syncer: DagSyncer<Arc<G>>,
    broadcaster: Arc<B>,
    config: StoreConfig,
    topic: String,
    writer: tokio::sync::Mutex<()>,
    key_locks: KeyLocks,
    pending: Mutex<BTreeSet<Cid>>,
    unannounced: Mutex<BTreeSet<Cid>>,
}

impl<D: Datastore, G: DagService, B: Broadcaster> MergeEngine<D, G, B> {
    pub fn new(
        namespace: Key,
        datastore: Arc<D>,
        dag: Arc<G>,
        broadcaster: Arc<B>,
        filter: Arc<DataFilter>,
        config: StoreConfig,
    ) -> Self {
        let heads = HeadIndex::new(Arc::clone(&datastore), namespace.child_string(HEADS_SEGMENT));
        let syncer = DagSyncer::with_config(
            dag,
            SyncConfig {
                max_depth: config.max_walk_depth,
                fetch_timeout: config.dag_timeout(),
                verify_nodes: true,
            },
        );
        let topic = config
            .topic
            .clone()
            .unwrap_or_else(|| namespace.as_str().to_string());

        Self {
            key_locks: KeyLocks::new(config.key_lock_stripes),
            namespace,
            datastore,
            heads,
            filter,
            syncer,
            broadcaster,
            topic,
            config,
            writer: tokio::sync::Mutex::new(()),
            pending: Mutex::new(BTreeSet::new()),
            unannounced: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn namespace(&self) -> &Key {
        &self.namespace
    }

    pub fn heads(&self) -> &HeadIndex<D> {
        &self.heads
    }

    pub fn filter(&self) -> &Arc<DataFilter> {
        &self.filter
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn datastore(&self) -> &Arc<D> {
        &self.datastore
    }

    pub fn dag(&self) -> &Arc<G> {
        self.syncer.dag()
    }

    pub fn broadcaster(&self) -> &Arc<B> {
        &self.broadcaster
    }

    /// Nodes whose application failed and that `repair` will retry.
    pub fn pending(&self) -> Vec<Cid> {
        self.pending.lock().iter().copied().collect()
    }

    /// Local nodes whose broadcast failed and that `repair` will announce.
    pub fn unannounced(&self) -> Vec<Cid> {
        self.unannounced.lock().iter().copied().collect()
    }

    /// Datastore key holding the record for `key`.
    ///
    /// The root and keys under the bookkeeping segments are rejected.
    pub fn record_key(&self, key: &Key) -> Result<Key> {
        match key.list().first().map(String::as_str) {
            None => Err(DbError::InvalidKey("the root key holds no record".to_string())),
            Some(HEADS_SEGMENT) | Some(PROCESSED_SEGMENT) => {
                Err(DbError::InvalidKey(format!("{} is reserved", key)))
            }
            Some(_) => Ok(self.namespace.child(key)),
        }
    }

    pub fn processed_key(&self, cid: &Cid) -> Key {
        self.namespace
            .child_string(PROCESSED_SEGMENT)
            .child_string(cid.to_hex())
    }

    /// Whether `cid` has been fully merged. A datastore error counts as
    /// unprocessed; merging again is harmless.
    pub fn is_processed(&self, cid: &Cid) -> bool {
        match self.datastore.has(&self.processed_key(cid)) {
            Ok(found) => found,
            Err(e) => {
                warn!(namespace = %self.namespace, cid = %cid.short(), error = %e, "processed check failed");
                false
            }
        }
    }

    /// The stored record for `key` (relative to the namespace).
    pub fn record(&self, key: &Key) -> Result<Option<Record>> {
        self.read_record(&self.record_key(key)?)
    }

    /// Every record strictly below `prefix`, keyed relative to the namespace.
    pub fn records(&self, prefix: &Key) -> Result<Vec<(Key, Record)>> {
        let scan_root = self.namespace.child(prefix);
        let mut result = Vec::new();
        for (key, bytes) in self.datastore.scan_prefix(&scan_root)? {
            let relative = match key.strip_prefix(&self.namespace) {
                Some(relative) => relative,
                None => continue,
            };
            if self.record_key(&relative).is_err() {
                continue;
            }
            result.push((relative, serde_json::from_slice(&bytes)?));
        }
        Ok(result)
    }

    /// Merge a delta authored on this replica and announce it.
    ///
    /// The delta's parents are the current heads; its priority is one above
    /// the highest of them, or 0 for the first delta of the namespace.
    pub async fn merge_local(&self, mut delta: Delta) -> Result<MergeOutcome> {
        if delta.is_empty() {
            return Err(DbError::UnsupportedOperation(
                "cannot merge an empty delta".to_string(),
            ));
        }

        let (parents, max_height) = self.heads.list()?;
        let height = if parents.is_empty() {
            0
        } else {
            max_height
                .checked_add(1)
                .ok_or(DbError::HeightOverflow(max_height))?
        };
        delta.set_priority(height);

        self.transition(None, height, MergeState::Filtering);
        let filtered = self.filter.filter_elements_on_delta(&mut delta);

        self.transition(None, height, MergeState::Persisting);
        let node = NodeBuilder::new()
            .with_parents(parents)
            .with_height(height)
            .with_payload(delta.encode()?)
            .build();
        let cid = node.cid;
        self.persist(node.clone())
            .await
            .map_err(|e| self.failed(cid, MergeState::Persisting, e))?;

        let applied = self.apply_and_commit(&node, &delta).await;

        // The node is durable in the DAG; peers can merge it even if
        // applying it here failed.
        self.transition(Some(cid), height, MergeState::Broadcasting);
        let published = self.publish(&node).await;
        if published.is_err() {
            self.unannounced.lock().insert(cid);
        }
        let changed = applied?;
        published.map_err(|e| self.failed(cid, MergeState::Broadcasting, e))?;

        self.transition(Some(cid), height, MergeState::Done);
        Ok(MergeOutcome {
            cid,
            height,
            filtered,
            changed,
            state: MergeState::Done,
        })
    }

    /// Merge a node received from a peer, together with any ancestors that
    /// have not been processed here yet. Returns one outcome per node
    /// merged, parents first; an already processed node yields none.
    pub async fn merge_remote(&self, node: MerkleNode) -> Result<Vec<MergeOutcome>> {
        if !node.verify() {
            return Err(DagError::VerificationFailed(node.cid).into());
        }
        if self.is_processed(&node.cid) {
            debug!(namespace = %self.namespace, cid = %node.cid.short(), "already processed");
            return Ok(Vec::new());
        }

        let branch = self
            .syncer
            .collect_unprocessed(node, |cid| self.is_processed(cid))
            .await?;

        let mut outcomes = Vec::with_capacity(branch.len());
        for node in branch {
            outcomes.push(self.merge_fetched(node).await?);
        }
        Ok(outcomes)
    }

    /// Retry every node whose application failed earlier and announce
    /// local nodes whose broadcast failed. Returns the number of nodes
    /// merged.
    pub async fn repair(&self) -> Result<usize> {
        for cid in self.unannounced() {
            let node = self.syncer.fetch(&cid).await?;
            self.publish(&node).await?;
            self.unannounced.lock().remove(&cid);
            info!(namespace = %self.namespace, cid = %cid.short(), "announced local node");
        }

        let mut repaired = 0;
        for cid in self.pending() {
            if self.is_processed(&cid) {
                self.pending.lock().remove(&cid);
                continue;
            }
            let node = self.syncer.fetch(&cid).await?;
            repaired += self.merge_remote(node).await?.len();
        }
        if repaired > 0 {
            info!(namespace = %self.namespace, repaired, "repair complete");
        }
        Ok(repaired)
    }

    async fn merge_fetched(&self, node: MerkleNode) -> Result<MergeOutcome> {
        let cid = node.cid;
        let height = node.height;

        // The node is immutable; filter tombstones only affect local state.
        self.transition(Some(cid), height, MergeState::Filtering);
        let mut delta = Delta::decode(&node.payload)
            .map_err(|e| self.failed(cid, MergeState::Filtering, e.into()))?;
        self.verify_heights(&node, &delta)
            .map_err(|e| self.failed(cid, MergeState::Filtering, e))?;
        let filtered = self.filter.filter_elements_on_delta(&mut delta);

        self.transition(Some(cid), height, MergeState::Persisting);
        self.persist(node.clone())
            .await
            .map_err(|e| self.failed(cid, MergeState::Persisting, e))?;

        let changed = self.apply_and_commit(&node, &delta).await?;

        self.transition(Some(cid), height, MergeState::Done);
        info!(namespace = %self.namespace, cid = %cid.short(), height, "accepted remote node");
        Ok(MergeOutcome {
            cid,
            height,
            filtered,
            changed,
            state: MergeState::Done,
        })
    }

    async fn apply_and_commit(&self, node: &MerkleNode, delta: &Delta) -> Result<usize> {
        let cid = node.cid;

        self.transition(Some(cid), node.height, MergeState::Applying);
        let changed = match self.apply(delta) {
            Ok(changed) => changed,
            Err(e) => {
                self.pending.lock().insert(cid);
                return Err(self.failed(cid, MergeState::Applying, e));
            }
        };

        self.transition(Some(cid), node.height, MergeState::UpdatingHeads);
        if let Err(e) = self.commit(node).await {
            self.pending.lock().insert(cid);
            return Err(self.failed(cid, MergeState::UpdatingHeads, e));
        }
        Ok(changed)
    }

    async fn persist(&self, node: MerkleNode) -> Result<Cid> {
        let expected = node.cid;
        let cid = tokio::time::timeout(self.config.dag_timeout(), self.dag().put(node))
            .await
            .map_err(|_| DbError::Timeout(format!("DAG put of {}", expected.short())))??;
        if cid != expected {
            return Err(DagError::VerificationFailed(expected).into());
        }
        Ok(cid)
    }

    async fn publish(&self, node: &MerkleNode) -> Result<()> {
        let bytes = node.encode()?;
        tokio::time::timeout(
            self.config.broadcast_timeout(),
            self.broadcaster.publish(&self.topic, bytes),
        )
        .await
        .map_err(|_| DbError::Timeout(format!("broadcast of {}", node.cid.short())))??;
        Ok(())
    }

    /// Join every element and tombstone of `delta` into the stored records.
    /// Returns the number of records that changed.
    fn apply(&self, delta: &Delta) -> Result<usize> {
        let incoming = delta
            .elements
            .iter()
            .map(|e| (e.key.as_str(), e.record()))
            .chain(delta.tombstones.iter().map(|t| (t.key.as_str(), t.record())));

        let mut joined: BTreeMap<Key, Record> = BTreeMap::new();
        for (raw_key, record) in incoming {
            let key = match self.record_key(&Key::new(raw_key)) {
                Ok(key) => key,
                Err(e) => {
                    warn!(namespace = %self.namespace, key = raw_key, error = %e, "skipping record");
                    continue;
                }
            };
            match joined.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    slot.get_mut().join_assign(&record);
                }
            }
        }

        let _guards = self.key_locks.lock(joined.keys());
        let mut batch = Batch::new();
        for (key, record) in joined {
            let mut current = self.read_record(&key)?;
            if current.join_assign(&Some(record)) {
                if let Some(record) = current {
                    batch.put(key, serde_json::to_vec(&record)?);
                }
            }
        }

        let changed = batch.len();
        if !batch.is_empty() {
            self.datastore.write_batch(batch)?;
        }
        Ok(changed)
    }

    /// Update heads for `node` and mark it processed.
    async fn commit(&self, node: &MerkleNode) -> Result<()> {
        let _writer = self.writer.lock().await;
        if self.is_processed(&node.cid) {
            return Ok(());
        }

        let mut replaced = false;
        for parent in &node.parents {
            if !self.heads.is_head(parent)? {
                continue;
            }
            if replaced {
                self.heads.remove(parent)?;
            } else {
                self.heads.replace(parent, node.cid, node.height)?;
                replaced = true;
            }
        }
        if !replaced {
            self.heads.add(node.cid, node.height)?;
        }

        self.datastore
            .put(&self.processed_key(&node.cid), node.height.to_le_bytes().to_vec())?;
        self.pending.lock().remove(&node.cid);
        Ok(())
    }

    /// Height recorded when `cid` was processed.
    fn processed_height(&self, cid: &Cid) -> Result<Option<u64>> {
        match self.datastore.get(&self.processed_key(cid))? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    DbError::Codec(format!("bad processed marker for {}", cid.short()))
                })?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Reject a node whose height does not follow from its parents, or
    /// whose records claim a priority above that height.
    fn verify_heights(&self, node: &MerkleNode, delta: &Delta) -> Result<()> {
        let mut expected = 0;
        for parent in &node.parents {
            let height = self.processed_height(parent)?.ok_or_else(|| {
                DbError::NotFound(format!("parent {} is not processed", parent.short()))
            })?;
            let above = height
                .checked_add(1)
                .ok_or(DagError::VerificationFailed(node.cid))?;
            expected = expected.max(above);
        }

        let consistent = node.height == expected
            && delta.priority == node.height
            && delta.elements.iter().all(|e| e.priority == node.height)
            && delta.tombstones.iter().all(|t| t.priority <= node.height);
        if !consistent {
            warn!(
                namespace = %self.namespace,
                cid = %node.cid.short(),
                height = node.height,
                expected,
                "node height does not match its parents"
            );
            return Err(DagError::VerificationFailed(node.cid).into());
        }
        Ok(())
    }

    fn read_record(&self, key: &Key) -> Result<Option<Record>> {
        match self.datastore.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn transition(&self, cid: Option<Cid>, height: u64, state: MergeState) {
        debug!(
            namespace = %self.namespace,
            cid = %cid.map(|c| c.short()).unwrap_or_default(),
            height,
            state = %state,
            "merge transition"
        );
    }

    fn failed(&self, cid: Cid, stage: MergeState, err: DbError) -> DbError {
        warn!(
            namespace = %self.namespace,
            cid = %cid.short(),
            stage = %stage,
            state = %MergeState::Failed,
            error = %err,
            "merge failed"
        );
        err
    }
}
