//! Ordered, case-insensitive header map.
//!
//! Keys are compared and ordered by their ASCII-lowercased form, so
//! `X-Test` and `x-test` name the same entry regardless of locale. The
//! spelling used by the first insertion is kept for display and for the
//! outgoing request.

use alloc::{collections::BTreeMap, string::String};

/// An ordered, case-insensitive `String → String` mapping.
///
/// Used both for outgoing request headers (handed mutably to the
/// `requestHeaders` listener) and for exposing response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    /// Normalized key → (original spelling, value).
    entries: BTreeMap<String, (String, String)>,
}

impl HeaderMap {
    /// Create an empty header map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a header, returning the previous value if the key was present.
    ///
    /// An existing entry keeps its original key spelling; only the value is
    /// replaced.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        let key = normalize(&name);
        match self.entries.get_mut(&key) {
            Some((_, existing)) => Some(core::mem::replace(existing, value)),
            None => {
                self.entries.insert(key, (name, value));
                None
            }
        }
    }

    /// Look up a header value by name (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&normalize(name)).map(|(_, v)| v.as_str())
    }

    /// Whether a header with this name is present (case-insensitive).
    #[must_use]
    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(&normalize(name))
    }

    /// Remove a header, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&normalize(name)).map(|(_, v)| v)
    }

    /// Number of distinct headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in case-insensitive key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    /// Later duplicates replace earlier values.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}
