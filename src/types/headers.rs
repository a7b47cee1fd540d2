//! Case-insensitive header multimap.
//!
//! Keys compare and hash on their ASCII-lowercased form while keeping the
//! caller's original spelling for output.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Header name with case-insensitive equality and hashing.
#[derive(Clone)]
pub struct HeaderKey {
    original: String,
    normalized: String,
}

impl HeaderKey {
    pub fn new(name: impl Into<String>) -> Self {
        let original = name.into();
        let normalized = original.to_ascii_lowercase();
        Self {
            original,
            normalized,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for HeaderKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for HeaderKey {}

impl Hash for HeaderKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.original)
    }
}

/// Multimap of header name → values, insertion order kept per name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: HashMap<HeaderKey, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .entry(HeaderKey::new(name))
            .or_default()
            .push(value.into());
    }

    /// Replace all values for `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(HeaderKey::new(name), vec![value.into()]);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.entries.remove(&HeaderKey::new(name))
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&HeaderKey::new(name))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&HeaderKey::new(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&HeaderKey::new(name))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs; a name with several values yields
    /// several pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    /// Copy every name from `defaults` that is not already present.
    pub fn merge_defaults(&mut self, defaults: &Headers) {
        for (key, values) in &defaults.entries {
            if !self.entries.contains_key(key) {
                self.entries.insert(key.clone(), values.clone());
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}
