//! # mdcs-merkle
//!
//! Merkle-DAG plumbing for the MDCS (Merkle-Delta CRDT Store) key-value core.
//!
//! This crate provides:
//! - Content identifiers and hash-linked nodes carrying encoded deltas
//! - The [`DagService`] collaborator trait and an in-memory implementation
//! - [`DagSyncer`] for fetching unprocessed history parents-first
//! - The [`Broadcaster`] collaborator trait and an in-memory hub
//!
//! ## Example
//!
//! ```rust
//! use mdcs_merkle::{DagService, MemoryDag, NodeBuilder};
//!
//! # tokio_test::block_on(async {
//! let dag = MemoryDag::new();
//!
//! let root = NodeBuilder::new().with_payload(b"first".to_vec()).build();
//! let root_cid = dag.put(root).await.unwrap();
//!
//! let child = NodeBuilder::new()
//!     .with_parent(root_cid)
//!     .with_height(1)
//!     .with_payload(b"second".to_vec())
//!     .build();
//! let child_cid = dag.put(child).await.unwrap();
//!
//! assert!(dag.ancestors(&child_cid).contains(&root_cid));
//! # });
//! ```

mod broadcaster;
mod cid;
mod dag;
mod node;
mod syncer;

pub use broadcaster::{
    BroadcastConfig, BroadcastError, BroadcastNetwork, BroadcastStats, Broadcaster,
    MemoryBroadcaster,
};
pub use cid::{Cid, ParseCidError};
pub use dag::{DagError, DagService, MemoryDag};
pub use node::{MerkleNode, NodeBuilder, NodeCodecError};
pub use syncer::{DagSyncer, SyncConfig, SyncError};
