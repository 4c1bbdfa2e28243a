//! Last-Write-Wins records
//!
//! Every key in the backing store holds one [`Record`]: the winning value
//! (or a tombstone) together with the [`Stamp`] of the write that produced it.
//!
//! Records are ordered by `(priority, id, is_tombstone)`. The highest record
//! wins a join, and at an identical stamp the tombstone wins, so a deleted
//! element can never be resurrected by a late copy of itself.

use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Write stamp used for conflict resolution.
///
/// Higher priority wins; equal priorities are broken by the larger id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    /// Priority of the write (the DAG height of the delta carrying it).
    pub priority: u64,
    /// Identifier distinguishing concurrent writers.
    pub id: String,
}

impl Stamp {
    pub fn new(priority: u64, id: impl Into<String>) -> Self {
        Self {
            priority,
            id: id.into(),
        }
    }

    /// Generate a fresh, globally unique writer id.
    pub fn generate_id() -> String {
        ulid::Ulid::new().to_string()
    }
}

/// The materialized state of one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stamp of the write that produced this state.
    pub stamp: Stamp,
    /// The value, or `None` when the key is tombstoned at `stamp`.
    pub value: Option<Vec<u8>>,
}

impl Record {
    /// A live value written at `stamp`.
    pub fn value(stamp: Stamp, value: Vec<u8>) -> Self {
        Self {
            stamp,
            value: Some(value),
        }
    }

    /// A tombstone covering every write up to and including `stamp`.
    pub fn tombstone(stamp: Stamp) -> Self {
        Self { stamp, value: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// The live value, if any.
    pub fn get(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    fn rank(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.is_tombstone().cmp(&other.is_tombstone()))
            // Same element seen with different bytes: pick deterministically
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl Lattice for Record {
    fn join(&self, other: &Self) -> Self {
        if self.rank(other) == Ordering::Less {
            other.clone()
        } else {
            self.clone()
        }
    }
}
