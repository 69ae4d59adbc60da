//! Ordered byte-string map with prefix queries
//!
//! Backs every rule table. Besides exact lookups it answers two ordered
//! queries the classifier needs:
//!
//! - [`PrefixMap::ancestors`]: stored keys that are prefixes of a needle,
//!   longest first
//! - [`PrefixMap::seek_le`]: forward iteration starting at the greatest key
//!   lexicographically `<=` a needle
//!
//! Lookups compare raw bytes, so needles never have to sit on UTF-8
//! character boundaries.

use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone)]
pub struct PrefixMap<V> {
    entries: BTreeMap<Vec<u8>, V>,
}

impl<V> Default for PrefixMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PrefixMap<V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert or overwrite `key`, returning the previous value
    pub fn insert(&mut self, key: &[u8], value: V) -> Option<V> {
        self.entries.insert(key.to_vec(), value)
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// All entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &V)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    /// Stored keys that are prefixes of `needle` (including `needle` itself),
    /// longest first
    pub fn ancestors<'m, 'n>(
        &'m self,
        needle: &'n [u8],
    ) -> impl Iterator<Item = (&'n [u8], &'m V)> + 'm
    where
        'n: 'm,
    {
        (1..=needle.len())
            .rev()
            .filter_map(move |len| self.entries.get(&needle[..len]).map(|v| (&needle[..len], v)))
    }

    /// Iterate forward from the greatest key `<= needle`
    ///
    /// When every key sorts after `needle` iteration starts at the first key.
    pub fn seek_le<'m>(&'m self, needle: &[u8]) -> impl Iterator<Item = (&'m [u8], &'m V)> + 'm {
        let start = self
            .entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(needle)))
            .next_back()
            .map(|(k, _)| k.clone());
        let range = match start {
            Some(key) => self.entries.range::<Vec<u8>, _>(key..),
            None => self.entries.range::<Vec<u8>, _>(..),
        };
        range.map(|(k, v)| (k.as_slice(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(keys: &[&str]) -> PrefixMap<usize> {
        let mut m = PrefixMap::new();
        for (i, k) in keys.iter().enumerate() {
            m.insert(k.as_bytes(), i);
        }
        m
    }

    #[test]
    fn test_exact_lookup() {
        let m = map(&["Foo", "Foo::Bar"]);
        assert_eq!(m.get(b"Foo::Bar"), Some(&1));
        assert_eq!(m.get(b"Foo::"), None);
        assert!(m.contains_key(b"Foo"));
    }

    #[test]
    fn test_ancestors_longest_first() {
        let m = map(&["A", "A::B", "A::B::C", "X"]);
        let found: Vec<&[u8]> = m.ancestors(b"A::B::C#d").map(|(k, _)| k).collect();
        assert_eq!(found, vec![&b"A::B::C"[..], &b"A::B"[..], &b"A"[..]]);
    }

    #[test]
    fn test_ancestors_none() {
        let m = map(&["Zed"]);
        assert_eq!(m.ancestors(b"Alpha").count(), 0);
        assert_eq!(m.ancestors(b"").count(), 0);
    }

    #[test]
    fn test_seek_le_starts_at_floor() {
        let m = map(&["Bar", "Foo", "Foo#", "Foo::", "Goo"]);
        let keys: Vec<&[u8]> = m.seek_le(b"Foo").map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"Foo"[..], &b"Foo#"[..], &b"Foo::"[..], &b"Goo"[..]]);
    }

    #[test]
    fn test_seek_le_before_first_key() {
        let m = map(&["B", "C"]);
        let keys: Vec<&[u8]> = m.seek_le(b"A").map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"B"[..], &b"C"[..]]);
    }

    #[test]
    fn test_overwrite_returns_previous() {
        let mut m = PrefixMap::new();
        assert_eq!(m.insert(b"k", 1), None);
        assert_eq!(m.insert(b"k", 2), Some(1));
        assert_eq!(m.len(), 1);
        m.clear();
        assert!(m.is_empty());
    }
}
