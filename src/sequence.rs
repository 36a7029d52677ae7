//! Sequence tokens for change feeds.
//!
//! A store's change feed identifies positions in its history with opaque
//! tokens. Older stores hand out plain integers (`42`), clustered ones hand
//! out strings with a numeric prefix (`42-g1AAAA...`), and some send a
//! vector clock array led by the counter (`[42,"g1AAAA..."]`). All of these
//! are ordered by that counter. Tokens without one rank above every counted
//! token (so they always move past the initial `0`) and order byte-wise
//! among themselves.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// An opaque, monotonically comparable position in a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeqToken(String);

impl SeqToken {
    /// Create a token from its raw representation
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The position before any change has been recorded.
    pub fn initial() -> Self {
        Self("0".to_string())
    }

    /// Raw token as sent to the store in `since=`
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading decimal counter, if the token has one
    pub fn counter(&self) -> Option<u64> {
        let raw = self.0.trim();
        let head = match raw.strip_prefix('[') {
            Some(rest) => rest
                .split([',', ']'])
                .next()
                .unwrap_or_default()
                .trim()
                .trim_matches('"'),
            None => raw,
        };
        let prefix = head.split('-').next().unwrap_or_default();
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        prefix.parse().ok()
    }
}

impl Default for SeqToken {
    fn default() -> Self {
        Self::initial()
    }
}

impl Ord for SeqToken {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.counter(), other.counter());
        (a.is_none(), a, &self.0).cmp(&(b.is_none(), b, &other.0))
    }
}

impl PartialOrd for SeqToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SeqToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SeqToken {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<u64> for SeqToken {
    fn from(counter: u64) -> Self {
        Self(counter.to_string())
    }
}

impl Serialize for SeqToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Integer tokens go back out as numbers so older stores accept them.
        match self.0.parse::<u64>() {
            Ok(n) => serializer.serialize_u64(n),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for SeqToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => Ok(SeqToken(s)),
            serde_json::Value::Number(n) => Ok(SeqToken(n.to_string())),
            // Some feeds send the raw vector clock as an array
            other @ serde_json::Value::Array(_) => Ok(SeqToken(other.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "invalid sequence token: {}",
                other
            ))),
        }
    }
}
