//! Content identifiers for Merkle nodes.
//!
//! A [`Cid`] is the SHA-256 digest of a node's canonical contents. It is
//! stable, comparable, and renders as lowercase hex, which is also the form
//! used in datastore keys (`<namespace>/heads/<cid>`).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 32-byte SHA-256 content identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cid([u8; 32]);

/// Error parsing a [`Cid`] from its hex form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid content id: {0:?}")]
pub struct ParseCidError(pub String);

impl Cid {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Cid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self::of_parts(&[data])
    }

    /// Digest of several byte slices fed in order.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Cid(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Cid(bytes))
    }

    /// Truncated display (first 8 chars).
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}...)", self.short())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Cid {
    type Err = ParseCidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::from_hex(s).ok_or_else(|| ParseCidError(s.to_string()))
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.to_hex()
    }
}

impl TryFrom<String> for Cid {
    type Error = ParseCidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_deterministic() {
        assert_eq!(Cid::of(b"hello world"), Cid::of(b"hello world"));
        assert_ne!(Cid::of(b"hello"), Cid::of(b"world"));
    }

    #[test]
    fn test_parts_match_concatenation() {
        assert_eq!(Cid::of_parts(&[b"hello", b"world"]), Cid::of(b"helloworld"));
    }

    #[test]
    fn test_hex_parse() {
        let cid = Cid::of(b"test data");
        let hex = cid.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Cid>().unwrap(), cid);
        assert!("zz".parse::<Cid>().is_err());
        assert!(Cid::from_hex(&hex[..10]).is_none());
    }

    #[test]
    fn test_serde_as_hex() {
        let cid = Cid::of(b"x");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", cid.to_hex()));
        let back: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
    }
}
