//! The DAG service collaborator.
//!
//! Content-addressed block storage and peer fetching live outside the core;
//! the merge engine only needs `put`, `get` and `has_block`. [`MemoryDag`]
//! is an in-process implementation: clones share the same block map, which
//! models a set of peers that can all fetch each other's blocks.

use crate::cid::Cid;
use crate::node::MerkleNode;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during DAG operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("Node not found: {}", .0.short())]
    NotFound(Cid),

    #[error("Verification failed for: {}", .0.short())]
    VerificationFailed(Cid),

    #[error("DAG service unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed node storage and retrieval.
#[async_trait]
pub trait DagService: Send + Sync {
    /// Store a node, returning its CID. Storing an existing node is a no-op.
    async fn put(&self, node: MerkleNode) -> Result<Cid, DagError>;

    /// Fetch a node by CID, locally or from peers.
    async fn get(&self, cid: &Cid) -> Result<MerkleNode, DagError>;

    /// Check whether the block is available without fetching it.
    async fn has_block(&self, cid: &Cid) -> Result<bool, DagError>;
}

#[async_trait]
impl<T: DagService + ?Sized> DagService for Arc<T> {
    async fn put(&self, node: MerkleNode) -> Result<Cid, DagError> {
        (**self).put(node).await
    }

    async fn get(&self, cid: &Cid) -> Result<MerkleNode, DagError> {
        (**self).get(cid).await
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool, DagError> {
        (**self).has_block(cid).await
    }
}

/// In-memory DAG shared by every clone.
#[derive(Clone, Debug, Default)]
pub struct MemoryDag {
    nodes: Arc<RwLock<HashMap<Cid, MerkleNode>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that sees the same blocks but can be taken offline on its own.
    pub fn connect(&self) -> Self {
        MemoryDag {
            nodes: Arc::clone(&self.nodes),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every call through this handle fail with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// All stored ancestors of `cid` (transitive, excluding `cid`).
    pub fn ancestors(&self, cid: &Cid) -> HashSet<Cid> {
        let nodes = self.nodes.read();
        let mut result = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(node) = nodes.get(cid) {
            queue.extend(node.parents.iter().copied());
        }

        while let Some(current) = queue.pop_front() {
            if result.insert(current) {
                if let Some(node) = nodes.get(&current) {
                    queue.extend(node.parents.iter().copied());
                }
            }
        }

        result
    }

    fn check_online(&self) -> Result<(), DagError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(DagError::Unavailable("memory DAG is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DagService for MemoryDag {
    async fn put(&self, node: MerkleNode) -> Result<Cid, DagError> {
        self.check_online()?;
        if !node.verify() {
            return Err(DagError::VerificationFailed(node.cid));
        }
        let cid = node.cid;
        self.nodes.write().entry(cid).or_insert(node);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<MerkleNode, DagError> {
        self.check_online()?;
        self.nodes
            .read()
            .get(cid)
            .cloned()
            .ok_or(DagError::NotFound(*cid))
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool, DagError> {
        self.check_online()?;
        Ok(self.nodes.read().contains_key(cid))
    }
}
