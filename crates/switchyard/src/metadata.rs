//! Out-of-band key/value data attached to a call.
//!
//! Keys are case-insensitive and stored lower-cased. Each key maps to a set
//! of values; the order in which values were added under a key is not
//! preserved.

use std::collections::{BTreeMap, BTreeSet};
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};

/// Well-known key carrying bearer credentials.
pub const AUTHORIZATION: &str = "authorization";

/// Well-known key carrying the caller's origin. Advisory only.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Outbound header carrying the call identifier.
pub const CALL_ID: &str = "x-call-id";

/// Header bag attached to every call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl Metadata {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Adds `value` under `key`. Returns `false` if that exact value was
    /// already present.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> bool {
        self.entries
            .entry(key.as_ref().to_ascii_lowercase())
            .or_default()
            .insert(value.into())
    }

    /// Returns one value stored under `key`.
    ///
    /// Keys normally carry a single value; when several are present the
    /// lexicographically smallest is returned.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lookup(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.lookup(key)
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates over every `(key, value)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| (key.as_str(), v.as_str())))
    }

    /// Adds every pair of `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    fn lookup(&self, key: &str) -> Option<&BTreeSet<String>> {
        if key.bytes().any(|b| b.is_ascii_uppercase()) {
            self.entries.get(&key.to_ascii_lowercase())
        } else {
            self.entries.get(key)
        }
    }

    /// Copies the ASCII entries of a tonic metadata map. Binary (`-bin`)
    /// entries and values that are not valid visible ASCII are skipped.
    #[must_use]
    pub fn from_tonic(map: &MetadataMap) -> Self {
        let mut metadata = Self::new();
        for entry in map.iter() {
            if let KeyAndValueRef::Ascii(key, value) = entry {
                if let Ok(value) = value.to_str() {
                    metadata.insert(key.as_str(), value);
                }
            }
        }
        metadata
    }

    /// Converts into a tonic metadata map, dropping pairs tonic rejects.
    #[must_use]
    pub fn to_tonic(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        for (key, value) in self.iter() {
            let Ok(key) = MetadataKey::<Ascii>::from_bytes(key.as_bytes()) else {
                tracing::debug!(key, "Dropping metadata key rejected by transport");
                continue;
            };
            match MetadataValue::try_from(value) {
                Ok(value) => {
                    map.append(key, value);
                }
                Err(_) => {
                    tracing::debug!(key = key.as_str(), "Dropping non-ASCII metadata value");
                }
            }
        }
        map
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}
