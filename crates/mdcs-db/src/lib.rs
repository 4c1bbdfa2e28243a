//! # mdcs-db
//!
//! Replicated key-value store layer for the MDCS (Merkle-Delta CRDT Store).
//!
//! This crate provides:
//! - The backing [`Datastore`] trait with in-memory and sled implementations
//! - The per-namespace [`HeadIndex`]
//! - The [`MergeEngine`] that applies local and remote deltas
//! - The public [`Store`] API
//!
//! ## Example
//!
//! ```rust
//! use mdcs_db::{MemoryDatastore, Store, StoreConfig};
//! use mdcs_merkle::{BroadcastNetwork, MemoryDag};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let dag = MemoryDag::new();
//! let network = BroadcastNetwork::new();
//!
//! let store = Store::new(
//!     "/kv",
//!     Arc::new(MemoryDatastore::new()),
//!     Arc::new(dag.connect()),
//!     Arc::new(network.join("replica-1")),
//!     StoreConfig::default(),
//! );
//!
//! store.put("greeting", b"hello".to_vec()).await.unwrap();
//! assert_eq!(store.get("greeting").unwrap(), b"hello");
//!
//! store.delete("greeting").await.unwrap();
//! assert!(!store.has("greeting").unwrap());
//! # });
//! ```

pub mod config;
pub mod datastore;
pub mod error;
pub mod heads;
pub mod merge;
pub mod store;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use datastore::{Batch, BatchOp, Datastore, MemoryDatastore, SledDatastore};
pub use error::{DbError, Result};
pub use heads::HeadIndex;
pub use merge::{MergeEngine, MergeOutcome, MergeState, HEADS_SEGMENT, PROCESSED_SEGMENT};
pub use store::{Store, StoreStats, WriteBatch, WriteOp};
