//! Deltas: the unit of replication.
//!
//! A [`Delta`] groups the element writes and tombstones of one logical
//! batch. Once a delta has been linked into the Merkle-DAG it is addressed
//! by the hash of its bytes and must never change, so every mutation
//! (filtering included) happens before it is encoded.

use crate::error::CodecError;
use mdcs_core::record::{Record, Stamp};
use serde::{Deserialize, Serialize};

/// A single key/value assertion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    /// Key relative to the store namespace.
    pub key: String,
    /// Opaque value bytes.
    pub value: Vec<u8>,
    /// Writer id used to break priority ties.
    pub id: String,
    /// Priority of the write; the height of the delta that carries it.
    pub priority: u64,
}

impl Element {
    /// Author a new element with a freshly generated id.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::with_id(key, value, Stamp::generate_id())
    }

    /// Build an element with an explicit writer id.
    pub fn with_id(key: impl Into<String>, value: impl Into<Vec<u8>>, id: impl Into<String>) -> Self {
        Element {
            key: key.into(),
            value: value.into(),
            id: id.into(),
            priority: 0,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.priority, self.id.clone())
    }

    /// The record this element contributes to the backing store.
    pub fn record(&self) -> Record {
        Record::value(self.stamp(), self.value.clone())
    }
}

/// A permanent deletion marker for a prior element.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tombstone {
    /// Key of the deleted element.
    pub key: String,
    /// Writer id of the deleted element.
    pub id: String,
    /// Priority of the deleted element.
    pub priority: u64,
}

impl Tombstone {
    pub fn new(key: impl Into<String>, stamp: Stamp) -> Self {
        Tombstone {
            key: key.into(),
            id: stamp.id,
            priority: stamp.priority,
        }
    }

    /// A tombstone that deletes exactly `element`.
    pub fn for_element(element: &Element) -> Self {
        Tombstone {
            key: element.key.clone(),
            id: element.id.clone(),
            priority: element.priority,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.priority, self.id.clone())
    }

    pub fn record(&self) -> Record {
        Record::tombstone(self.stamp())
    }
}

/// An append-only batch of elements and tombstones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub elements: Vec<Element>,
    pub tombstones: Vec<Tombstone>,
    /// Height assigned by the author.
    pub priority: u64,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element. It inherits the delta's priority.
    pub fn add_element(&mut self, mut element: Element) {
        element.priority = self.priority;
        self.elements.push(element);
    }

    pub fn add_tombstone(&mut self, tombstone: Tombstone) {
        self.tombstones.push(tombstone);
    }

    /// Set the delta priority and re-stamp every element it carries.
    ///
    /// Tombstones keep the stamp of the element they delete.
    pub fn set_priority(&mut self, priority: u64) {
        self.priority = priority;
        for element in &mut self.elements {
            element.priority = priority;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.tombstones.is_empty()
    }

    /// Number of elements plus tombstones.
    pub fn len(&self) -> usize {
        self.elements.len() + self.tombstones.len()
    }

    /// Serialize for a DAG payload.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
