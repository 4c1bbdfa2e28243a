//! MDCS Delta - delta records and the data filter
//!
//! A delta is the atomic unit a replica authors or receives: a batch of
//! element writes plus tombstones. Before a delta is linked into the
//! Merkle-DAG it passes through the [`DataFilter`], which may convert
//! rejected elements into tombstones.
//!
//! ```text
//! author / receive ──► filter_elements_on_delta ──► encode ──► DAG put
//! ```
//!
//! # Example
//!
//! ```rust
//! use mdcs_delta::{DataFilter, Delta, Element, Tombstone};
//!
//! let filter = DataFilter::new(true);
//! filter
//!     .register_element_filter("^private/", |e: &Element| Some(vec![Tombstone::for_element(e)]))
//!     .unwrap();
//!
//! let mut delta = Delta::new();
//! delta.add_element(Element::new("private/secret", b"x".to_vec()));
//! delta.add_element(Element::new("public/hello", b"y".to_vec()));
//!
//! assert_eq!(filter.filter_elements_on_delta(&mut delta), 1);
//! assert_eq!(delta.tombstones[0].key, "private/secret");
//! ```

pub mod delta;
pub mod error;
pub mod filter;

pub use delta::{Delta, Element, Tombstone};
pub use error::{CodecError, FilterError};
pub use filter::{DataFilter, FilterRule, TombstoneRule};
