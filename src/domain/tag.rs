//! Tags and tag sets.
//!
//! A [`Tag`] is a `(key, value)` pair attached to data. Keys prefixed
//! `knit#` are reserved for the system; users cannot register them
//! directly. A [`TagSet`] keeps its tags in a deterministic order so that
//! equality, hashing and wire output are stable.

use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::KnitError;

/// Prefix of system-reserved tag keys.
pub const SYSTEM_TAG_PREFIX: &str = "knit#";

/// System tag holding the knit id of the data itself.
pub const KEY_KNIT_ID: &str = "knit#id";

/// System tag holding the creation timestamp (RFC 3339).
pub const KEY_TIMESTAMP: &str = "knit#timestamp";

/// System tag marking data that is not (or never will be) queryable.
pub const KEY_TRANSIENT: &str = "knit#transient";

/// `knit#transient` value while the producing run is still alive.
pub const VALUE_TRANSIENT_PROCESSING: &str = "processing";

/// `knit#transient` value after the producing run failed.
pub const VALUE_TRANSIENT_FAILED: &str = "failed";

/// A `(key, value)` metadata pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether the key is in the `knit#` reserved namespace.
    pub fn is_system(&self) -> bool {
        self.key.starts_with(SYSTEM_TAG_PREFIX)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

impl FromStr for Tag {
    type Err = KnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((key, value)) if !key.is_empty() => {
                Ok(Tag::new(key.trim(), value.trim_start()))
            }
            _ => Err(KnitError::bad_request(format!(
                "`{s}` is not a tag; expected `key:value`"
            ))),
        }
    }
}

/// An ordered set of [`Tag`]s.
///
/// Ordering is lexicographic on `(key, value)`, which makes two sets with
/// the same members compare and serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self(tags.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    /// Insert a tag. Returns whether the set changed.
    pub fn insert(&mut self, tag: Tag) -> bool {
        self.0.insert(tag)
    }

    /// Remove every tag with the given key. Returns whether the set changed.
    pub fn remove_key(&mut self, key: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|t| t.key != key);
        before != self.0.len()
    }

    /// First value recorded under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// Whether every tag of `other` is also in `self`.
    pub fn is_superset_of(&self, other: &TagSet) -> bool {
        other.0.iter().all(|t| self.0.contains(t))
    }

    /// The `knit#timestamp` tag parsed as an RFC 3339 timestamp.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.get(KEY_TIMESTAMP)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TagSet {
    type Item = Tag;
    type IntoIter = std::collections::btree_set::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
