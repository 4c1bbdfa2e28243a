//! # mdcs-core
//!
//! Value types shared by every layer of the Merkle-Delta key-value store:
//!
//! - [`key::Key`]: hierarchical namespace keys
//! - [`lattice::Lattice`]: the join-semilattice contract
//! - [`record::Record`]: last-writer-wins records with tombstones

pub mod key;
pub mod lattice;
pub mod record;

pub use key::Key;
pub use lattice::Lattice;
pub use record::{Record, Stamp};
