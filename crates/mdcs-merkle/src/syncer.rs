//! DAG walking for gap repair.
//!
//! When a node arrives whose ancestors have not been processed locally,
//! the [`DagSyncer`] walks backwards through the DAG service, fetching every
//! unprocessed ancestor, and returns them parents-first so the caller can
//! apply them in causal order.

use crate::cid::Cid;
use crate::dag::{DagError, DagService};
use crate::node::MerkleNode;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during synchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    #[error("Verification failed: {}", .0.short())]
    VerificationFailed(Cid),

    #[error("Fetch of {} timed out", .0.short())]
    Timeout(Cid),

    #[error("Maximum traversal depth exceeded")]
    MaxDepthExceeded,
}

/// Configuration for the DAG syncer.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Maximum number of ancestor levels to walk for one node.
    pub max_depth: usize,

    /// Timeout for a single block fetch.
    pub fetch_timeout: Duration,

    /// Whether to verify fetched nodes.
    pub verify_nodes: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_depth: 1000,
            fetch_timeout: Duration::from_secs(5),
            verify_nodes: true,
        }
    }
}

/// Fetches missing history from a DAG service.
pub struct DagSyncer<D: DagService> {
    dag: D,
    config: SyncConfig,
}

impl<D: DagService> DagSyncer<D> {
    pub fn new(dag: D) -> Self {
        DagSyncer {
            dag,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(dag: D, config: SyncConfig) -> Self {
        DagSyncer { dag, config }
    }

    pub fn dag(&self) -> &D {
        &self.dag
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetch one node under the configured timeout, verifying it.
    pub async fn fetch(&self, cid: &Cid) -> Result<MerkleNode, SyncError> {
        let node = tokio::time::timeout(self.config.fetch_timeout, self.dag.get(cid))
            .await
            .map_err(|_| SyncError::Timeout(*cid))??;

        if self.config.verify_nodes && (node.cid != *cid || !node.verify()) {
            return Err(SyncError::VerificationFailed(*cid));
        }
        Ok(node)
    }

    /// Collect `start` and every ancestor for which `is_processed` is false,
    /// stopping at processed nodes. The result is in causal order: every
    /// node comes after all of its collected parents.
    pub async fn collect_unprocessed<F>(
        &self,
        start: MerkleNode,
        mut is_processed: F,
    ) -> Result<Vec<MerkleNode>, SyncError>
    where
        F: FnMut(&Cid) -> bool,
    {
        let mut collected: HashMap<Cid, MerkleNode> = HashMap::new();
        let mut visited: HashSet<Cid> = HashSet::from([start.cid]);
        let mut queue: VecDeque<(MerkleNode, usize)> = VecDeque::from([(start, 0)]);

        while let Some((node, depth)) = queue.pop_front() {
            for parent in &node.parents {
                if !visited.insert(*parent) || is_processed(parent) {
                    continue;
                }
                if depth + 1 > self.config.max_depth {
                    return Err(SyncError::MaxDepthExceeded);
                }
                let fetched = self.fetch(parent).await?;
                queue.push_back((fetched, depth + 1));
            }
            collected.insert(node.cid, node);
        }

        debug!(nodes = collected.len(), "collected unprocessed branch");
        Ok(causal_order(collected))
    }
}

/// Kahn's algorithm restricted to `nodes`; ties broken by CID.
fn causal_order(mut nodes: HashMap<Cid, MerkleNode>) -> Vec<MerkleNode> {
    let mut in_degree: HashMap<Cid, usize> = HashMap::new();
    let mut children: HashMap<Cid, Vec<Cid>> = HashMap::new();

    for (cid, node) in &nodes {
        let degree = node
            .parents
            .iter()
            .filter(|p| nodes.contains_key(p))
            .count();
        in_degree.insert(*cid, degree);
        for parent in node.parents.iter().filter(|p| nodes.contains_key(p)) {
            children.entry(*parent).or_default().push(*cid);
        }
    }

    let mut ready: BTreeSet<Cid> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(cid, _)| *cid)
        .collect();
    let mut result = Vec::with_capacity(nodes.len());

    while let Some(cid) = ready.pop_first() {
        if let Some(kids) = children.get(&cid) {
            for child in kids {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
        if let Some(node) = nodes.remove(&cid) {
            result.push(node);
        }
    }

    result
}
