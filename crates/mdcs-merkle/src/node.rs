//! Merkle node definition and builder.
//!
//! Each node in the Merkle-DAG contains:
//! - A content identifier (CID) computed from its contents
//! - References to parent nodes (the heads the author saw)
//! - Its height: 0 for a root, otherwise one more than its highest parent
//! - A payload: the encoded delta

use crate::cid::Cid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error decoding a node received from a peer.
#[derive(Error, Debug)]
#[error("Node codec error: {0}")]
pub struct NodeCodecError(#[from] serde_json::Error);

/// A node in the Merkle-DAG.
///
/// The CID is a digest of parents, height and payload, so any change to
/// the node changes its CID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub cid: Cid,
    /// Causal predecessors, kept sorted.
    pub parents: Vec<Cid>,
    pub height: u64,
    /// Encoded delta bytes.
    pub payload: Vec<u8>,
}

impl MerkleNode {
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Check if `cid` is a direct parent (not transitive ancestry).
    pub fn has_parent(&self, cid: &Cid) -> bool {
        self.parents.binary_search(cid).is_ok()
    }

    fn compute_cid(parents: &[Cid], height: u64, payload: &[u8]) -> Cid {
        let count = (parents.len() as u64).to_le_bytes();
        let height = height.to_le_bytes();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(parents.len() + 3);
        parts.push(&count);
        for parent in parents {
            parts.push(parent.as_bytes());
        }
        parts.push(&height);
        parts.push(payload);
        Cid::of_parts(&parts)
    }

    /// Verify that the CID matches the node's contents.
    pub fn verify(&self) -> bool {
        Self::compute_cid(&self.parents, self.height, &self.payload) == self.cid
    }

    /// Wire form used for DAG blocks and broadcast.
    pub fn encode(&self) -> Result<Vec<u8>, NodeCodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NodeCodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Builder for Merkle nodes.
#[derive(Clone, Debug, Default)]
pub struct NodeBuilder {
    parents: Vec<Cid>,
    height: u64,
    payload: Vec<u8>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parents(mut self, parents: Vec<Cid>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_parent(mut self, parent: Cid) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn with_height(mut self, height: u64) -> Self {
        self.height = height;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Build the node, computing its CID.
    pub fn build(mut self) -> MerkleNode {
        self.parents.sort();
        self.parents.dedup();
        let cid = MerkleNode::compute_cid(&self.parents, self.height, &self.payload);

        MerkleNode {
            cid,
            parents: self.parents,
            height: self.height,
            payload: self.payload,
        }
    }
}
