//! Data filter behaviour on whole deltas
//!
//! These tests cover the default policies, pattern short-circuiting and
//! filtering from several threads while rules are being registered.

use mdcs_delta::{DataFilter, Delta, Element, Tombstone};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

fn delta_for(keys: &[String]) -> Delta {
    let mut delta = Delta::new();
    delta.set_priority(3);
    for key in keys {
        delta.add_element(Element::new(key.clone(), key.as_bytes().to_vec()));
    }
    delta
}

proptest! {
    #[test]
    fn default_accept_adds_no_tombstones(keys in prop::collection::vec("[a-z]{1,8}", 0..20)) {
        let filter = DataFilter::new(true);
        let mut delta = delta_for(&keys);
        prop_assert_eq!(filter.filter_elements_on_delta(&mut delta), 0);
        prop_assert!(delta.tombstones.is_empty());
    }

    #[test]
    fn default_reject_tombstones_every_element(keys in prop::collection::vec("[a-z]{1,8}", 0..20)) {
        let filter = DataFilter::new(false);
        let mut delta = delta_for(&keys);
        prop_assert_eq!(filter.filter_elements_on_delta(&mut delta), keys.len());
        for (element, tomb) in delta.elements.iter().zip(&delta.tombstones) {
            prop_assert_eq!(tomb, &Tombstone::for_element(element));
        }
    }
}

#[test]
fn matching_rule_short_circuits_default_policy() {
    let filter = DataFilter::new(false);
    let custom = vec![
        Tombstone {
            key: "audit/1".to_string(),
            id: "custom-a".to_string(),
            priority: 1,
        },
        Tombstone {
            key: "audit/2".to_string(),
            id: "custom-b".to_string(),
            priority: 1,
        },
    ];
    let returned = custom.clone();
    filter
        .register_element_filter("foo/.*", move |_: &Element| Some(returned.clone()))
        .unwrap();

    let mut delta = Delta::new();
    delta.add_element(Element::new("foo/bar", b"1".to_vec()));

    assert_eq!(filter.filter_elements_on_delta(&mut delta), 2);
    // Exactly the rule's list, no default tombstone for foo/bar
    assert_eq!(delta.tombstones, custom);
}

#[test]
fn tombstones_are_appended_after_existing_ones() {
    let filter = DataFilter::new(false);
    let mut delta = Delta::new();
    let existing = Tombstone {
        key: "old".to_string(),
        id: "old-id".to_string(),
        priority: 0,
    };
    delta.add_tombstone(existing.clone());
    delta.add_element(Element::new("new", b"1".to_vec()));

    filter.filter_elements_on_delta(&mut delta);

    assert_eq!(delta.tombstones.len(), 2);
    assert_eq!(delta.tombstones[0], existing);
    assert_eq!(delta.tombstones[1].key, "new");
}

#[test]
fn mixed_policy_per_key_family() {
    let filter = DataFilter::new(true);
    filter
        .register_element_filter("^/?blocked/", |e: &Element| {
            Some(vec![Tombstone::for_element(e)])
        })
        .unwrap();

    let mut delta = Delta::new();
    delta.add_element(Element::new("blocked/a", b"1".to_vec()));
    delta.add_element(Element::new("open/a", b"2".to_vec()));
    delta.add_element(Element::new("/blocked/b", b"3".to_vec()));

    assert_eq!(filter.filter_elements_on_delta(&mut delta), 2);
    let keys: Vec<_> = delta.tombstones.iter().map(|t| t.key.as_str()).collect();
    assert_eq!(keys, vec!["blocked/a", "/blocked/b"]);

    filter.unregister_element_filter("^/?blocked/");
    let mut again = Delta::new();
    again.add_element(Element::new("blocked/a", b"1".to_vec()));
    assert_eq!(filter.filter_elements_on_delta(&mut again), 0);
}

#[test]
fn concurrent_filtering_and_registration() {
    let filter = Arc::new(DataFilter::new(true));
    let mut handles = Vec::new();

    for t in 0..4 {
        let filter = Arc::clone(&filter);
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                let pattern = format!("^t{}-{}$", t, i);
                filter
                    .register_element_filter(&pattern, |e: &Element| {
                        Some(vec![Tombstone::for_element(e)])
                    })
                    .unwrap();
                let mut delta = Delta::new();
                delta.add_element(Element::new(format!("t{}-{}", t, i), b"x".to_vec()));
                assert_eq!(filter.filter_elements_on_delta(&mut delta), 1);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(filter.element_filter_count(), 200);
}
