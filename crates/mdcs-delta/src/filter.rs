//! Pluggable accept/reject policy for incoming deltas.
//!
//! The [`DataFilter`] holds two independent registries, one for element
//! rules and one for tombstone rules, each keyed by a regular expression
//! that is matched against element keys. Filtering takes a snapshot of the
//! registry under a brief read lock and then runs the rules without holding
//! any lock, so rules must be synchronous and quick.
//!
//! # Precedence
//!
//! When several patterns match the same key, the longest pattern is tried
//! first (ties broken by lexicographic pattern order). Only the first match
//! is applied.

use crate::delta::{Delta, Element, Tombstone};
use crate::error::FilterError;
use parking_lot::RwLock;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Decides what happens to an element whose key matched the rule's pattern.
///
/// Returning `None` or an empty list accepts the element; otherwise the
/// returned tombstones are added to the delta.
pub trait FilterRule: Send + Sync {
    fn filter(&self, element: &Element) -> Option<Vec<Tombstone>>;
}

impl<F> FilterRule for F
where
    F: Fn(&Element) -> Option<Vec<Tombstone>> + Send + Sync,
{
    fn filter(&self, element: &Element) -> Option<Vec<Tombstone>> {
        self(element)
    }
}

/// Decides whether a tombstone may be removed again.
pub trait TombstoneRule: Send + Sync {
    fn allow_removal(&self, tombstone: &Tombstone) -> bool;
}

impl<F> TombstoneRule for F
where
    F: Fn(&Tombstone) -> bool + Send + Sync,
{
    fn allow_removal(&self, tombstone: &Tombstone) -> bool {
        self(tombstone)
    }
}

struct Entry<R: ?Sized> {
    regex: Regex,
    rule: Arc<R>,
}

impl<R: ?Sized> Clone for Entry<R> {
    fn clone(&self) -> Self {
        Entry {
            regex: self.regex.clone(),
            rule: Arc::clone(&self.rule),
        }
    }
}

/// One pattern → rule map behind its own lock.
struct Registry<R: ?Sized> {
    entries: RwLock<HashMap<String, Entry<R>>>,
}

impl<R: ?Sized> Registry<R> {
    fn new() -> Self {
        Registry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, pattern: &str, rule: Arc<R>) -> Result<bool, FilterError> {
        let regex = Regex::new(pattern).map_err(|source| FilterError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.entries
            .write()
            .insert(pattern.to_string(), Entry { regex, rule });
        Ok(true)
    }

    fn unregister(&self, pattern: &str) {
        self.entries.write().remove(pattern);
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Copy the registry in precedence order.
    fn snapshot(&self) -> Vec<(String, Entry<R>)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(pattern, entry)| (pattern.clone(), entry.clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| (Reverse(a.len()), a).cmp(&(Reverse(b.len()), b)));
        entries
    }
}

/// Accept/reject policy engine shared by every merge.
pub struct DataFilter {
    accept_by_default: bool,
    elements: Registry<dyn FilterRule>,
    tombstones: Registry<dyn TombstoneRule>,
}

impl DataFilter {
    /// Create a filter. Elements matching no pattern are accepted when
    /// `accept_by_default` is set and tombstoned otherwise.
    pub fn new(accept_by_default: bool) -> Self {
        DataFilter {
            accept_by_default,
            elements: Registry::new(),
            tombstones: Registry::new(),
        }
    }

    pub fn accept_by_default(&self) -> bool {
        self.accept_by_default
    }

    /// Register (or replace) the element rule for `pattern`.
    pub fn register_element_filter<R>(&self, pattern: &str, rule: R) -> Result<bool, FilterError>
    where
        R: FilterRule + 'static,
    {
        self.elements.register(pattern, Arc::new(rule))
    }

    /// Register (or replace) the tombstone rule for `pattern`.
    pub fn register_tombstone_filter<R>(&self, pattern: &str, rule: R) -> Result<bool, FilterError>
    where
        R: TombstoneRule + 'static,
    {
        self.tombstones.register(pattern, Arc::new(rule))
    }

    pub fn unregister_element_filter(&self, pattern: &str) {
        self.elements.unregister(pattern);
    }

    pub fn unregister_tombstone_filter(&self, pattern: &str) {
        self.tombstones.unregister(pattern);
    }

    pub fn element_filter_count(&self) -> usize {
        self.elements.len()
    }

    pub fn tombstone_filter_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Run every element of `delta` through the registered rules.
    ///
    /// Tombstones produced by the pass are appended once the whole pass is
    /// done. Returns how many were appended.
    pub fn filter_elements_on_delta(&self, delta: &mut Delta) -> usize {
        let rules = self.elements.snapshot();
        let mut generated = Vec::new();

        for element in &delta.elements {
            let matched = rules
                .iter()
                .find(|(_, entry)| entry.regex.is_match(&element.key));

            match matched {
                Some((pattern, entry)) => {
                    if let Some(tombstones) = entry.rule.filter(element) {
                        if !tombstones.is_empty() {
                            debug!(
                                key = %element.key,
                                pattern = %pattern,
                                count = tombstones.len(),
                                "element rejected by filter"
                            );
                        }
                        generated.extend(tombstones);
                    }
                }
                None if self.accept_by_default => {}
                None => {
                    debug!(key = %element.key, "element rejected by default policy");
                    generated.push(Tombstone::for_element(element));
                }
            }
        }

        let count = generated.len();
        delta.tombstones.extend(generated);
        count
    }

    /// Tombstones are permanent; removing them is not supported.
    pub fn filter_tombstones_on_delta(&self, _delta: &mut Delta) -> Result<(), FilterError> {
        Err(FilterError::Unsupported(
            "tombstones cannot be filtered out of a delta".to_string(),
        ))
    }
}

impl Default for DataFilter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for DataFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFilter")
            .field("accept_by_default", &self.accept_by_default)
            .field("element_filters", &self.element_filter_count())
            .field("tombstone_filters", &self.tombstone_filter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(_: &Element) -> Option<Vec<Tombstone>> {
        None
    }

    fn delta_with(keys: &[&str]) -> Delta {
        let mut delta = Delta::new();
        for key in keys {
            delta.add_element(Element::new(*key, b"v".to_vec()));
        }
        delta
    }

    #[test]
    fn test_default_accept() {
        let filter = DataFilter::new(true);
        let mut delta = delta_with(&["a", "b", "c"]);
        assert_eq!(filter.filter_elements_on_delta(&mut delta), 0);
        assert!(delta.tombstones.is_empty());
        assert_eq!(delta.elements.len(), 3);
    }

    #[test]
    fn test_default_reject() {
        let filter = DataFilter::new(false);
        let mut delta = delta_with(&["a", "b"]);
        assert_eq!(filter.filter_elements_on_delta(&mut delta), 2);
        assert_eq!(delta.tombstones[0], Tombstone::for_element(&delta.elements[0]));
        assert_eq!(delta.tombstones[1], Tombstone::for_element(&delta.elements[1]));
    }

    #[test]
    fn test_invalid_pattern() {
        let filter = DataFilter::new(true);
        let result = filter.register_element_filter("foo(", accept);
        assert!(matches!(result, Err(FilterError::InvalidPattern { .. })));
        assert_eq!(filter.element_filter_count(), 0);
    }

    #[test]
    fn test_register_overwrites() {
        let filter = DataFilter::new(false);
        assert!(filter
            .register_element_filter("^a", |e: &Element| Some(vec![Tombstone::for_element(e)]))
            .unwrap());
        assert!(filter.register_element_filter("^a", accept).unwrap());
        assert_eq!(filter.element_filter_count(), 1);

        let mut delta = delta_with(&["abc"]);
        assert_eq!(filter.filter_elements_on_delta(&mut delta), 0);
    }

    #[test]
    fn test_unregister_missing_is_noop() {
        let filter = DataFilter::new(true);
        filter.unregister_element_filter("nothing");
        filter.unregister_tombstone_filter("nothing");
        assert_eq!(filter.element_filter_count(), 0);
    }

    #[test]
    fn test_longest_pattern_wins() {
        let filter = DataFilter::new(true);
        filter
            .register_element_filter("^foo", |e: &Element| Some(vec![Tombstone::for_element(e)]))
            .unwrap();
        filter
            .register_element_filter("^foo/keep", accept)
            .unwrap();

        let mut delta = delta_with(&["foo/keep/1", "foo/drop"]);
        assert_eq!(filter.filter_elements_on_delta(&mut delta), 1);
        assert_eq!(delta.tombstones[0].key, "foo/drop");
    }

    #[test]
    fn test_tombstone_filtering_unsupported() {
        let filter = DataFilter::new(true);
        filter
            .register_tombstone_filter(".*", |_: &Tombstone| true)
            .unwrap();
        assert_eq!(filter.tombstone_filter_count(), 1);

        let mut delta = Delta::new();
        assert!(matches!(
            filter.filter_tombstones_on_delta(&mut delta),
            Err(FilterError::Unsupported(_))
        ));
    }
}
