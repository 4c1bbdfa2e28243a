//! Hierarchical namespace keys.
//!
//! A [`Key`] is an ordered list of non-empty segments rendered as `/a/b/c`.
//! Every stored element and every piece of bookkeeping (heads, processed
//! markers) lives under a key, so namespaces partition the key space into a
//! tree of named prefixes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Path separator used by every key.
pub const SEPARATOR: char = '/';

/// An immutable, normalized hierarchical key.
///
/// Construction never fails: leading, trailing and repeated separators are
/// collapsed, so `Key::new("a//b/")` and `Key::new("/a/b")` are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct Key {
    /// Normalized form, always starting with `/`.
    path: String,
}

impl Key {
    /// Create a key from any string, normalizing separators.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let segments: Vec<&str> = raw
            .as_ref()
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
            .collect();

        let mut path = String::with_capacity(raw.as_ref().len() + 1);
        if segments.is_empty() {
            path.push(SEPARATOR);
        }
        for segment in segments {
            path.push(SEPARATOR);
            path.push_str(segment);
        }

        Key { path }
    }

    /// The root key `/`, which has no segments.
    pub fn root() -> Self {
        Key {
            path: SEPARATOR.to_string(),
        }
    }

    /// The normalized string form.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Check if this is the root key.
    pub fn is_root(&self) -> bool {
        self.path.len() == 1
    }

    /// Derive a child key by appending `segment`.
    ///
    /// The segment gets a leading separator if it is missing; a segment that
    /// itself contains separators appends several path components.
    pub fn child_string(&self, segment: impl AsRef<str>) -> Self {
        Key::new(format!("{}{}{}", self.path, SEPARATOR, segment.as_ref()))
    }

    /// Derive a child key by appending all segments of `other`.
    pub fn child(&self, other: &Key) -> Self {
        if other.is_root() {
            return self.clone();
        }
        if self.is_root() {
            return other.clone();
        }
        Key {
            path: format!("{}{}", self.path, other.path),
        }
    }

    /// A key is top-level when it has exactly one segment.
    pub fn is_top_level(&self) -> bool {
        self.segments().count() == 1
    }

    /// The ordered segments of this key.
    pub fn list(&self) -> Vec<String> {
        self.segments().map(str::to_string).collect()
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The last segment, or an empty string for the root.
    pub fn name(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    /// The key with its last segment removed. The root is its own parent.
    pub fn parent(&self) -> Key {
        match self.path.rfind(SEPARATOR) {
            Some(0) | None => Key::root(),
            Some(idx) => Key {
                path: self.path[..idx].to_string(),
            },
        }
    }

    /// Check whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.path.len() > self.path.len()
            && other.path.starts_with(&self.path)
            && other.path[self.path.len()..].starts_with(SEPARATOR)
    }

    /// The remainder of `self` below `prefix`, if `prefix` is an ancestor.
    pub fn strip_prefix(&self, prefix: &Key) -> Option<Key> {
        if prefix.is_ancestor_of(self) {
            Some(Key::new(&self.path[prefix.path.len()..]))
        } else {
            None
        }
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split(SEPARATOR).filter(|s| !s.is_empty())
    }
}

impl Default for Key {
    fn default() -> Self {
        Key::root()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.path)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl From<&str> for Key {
    fn from(raw: &str) -> Self {
        Key::new(raw)
    }
}

impl From<String> for Key {
    fn from(raw: String) -> Self {
        Key::new(raw)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.path
    }
}

impl FromStr for Key {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Key::new(s))
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.path
    }
}
