//! A map type implemented as a sorted list of key/value pairs.
//!
//! Jump tables are small (one entry per `switch` arm) and are walked far more often than they are searched,
//! so a flat sorted vector beats both `BTreeMap` and `HashMap` here and gives a deterministic iteration order.

use std::prelude::v1::*;
use std::borrow::Borrow;

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Entry<K: Ord, V> {
    pub key: K,
    pub value: V,
}

/// A map type implemented as a list of key/value pairs sorted by key.
/// Lookups are `O(log(n))`, insertions are `O(n)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VecMap<K: Ord, V> {
    values: Vec<Entry<K, V>>,
}
impl<K: Ord, V> VecMap<K, V> {
    /// Creates a new, empty map.
    pub fn new() -> Self {
        Self { values: vec![] }
    }
    /// Gets an immutable reference to a stored value, if it exists.
    pub fn get<Q: ?Sized + Ord>(&self, key: &Q) -> Option<&V> where K: Borrow<Q> {
        self.values.binary_search_by(|x| x.key.borrow().cmp(key)).ok().map(|i| &self.values[i].value)
    }
    /// Inserts a new value into the map.
    /// If an entry with the same key already exists, the previous value is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self.values.binary_search_by(|x| x.key.cmp(&key)) {
            Ok(i) => Some(core::mem::replace(&mut self.values[i].value, value)),
            Err(i) => {
                self.values.insert(i, Entry { key, value });
                None
            }
        }
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    /// Iterates through the map in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.values.iter().map(|x| (&x.key, &x.value))
    }
    /// Iterates through the stored values in key order, allowing them to be rewritten in place.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.values.iter_mut().map(|x| &mut x.value)
    }
}

impl<K: Ord, V> Default for VecMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for VecMap<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut res = VecMap::new();
        for (k, v) in iter {
            res.insert(k, v);
        }
        res
    }
}

#[cfg(feature = "serde")]
impl<K: Ord + Serialize, V: Serialize> Serialize for VecMap<K, V> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}
/// Entries are reinserted one at a time, so unsorted input is sorted and a repeated key keeps its last value.
#[cfg(feature = "serde")]
impl<'de, K: Ord + Deserialize<'de>, V: Deserialize<'de>> Deserialize<'de> for VecMap<K, V> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Vec::<Entry<K, V>>::deserialize(deserializer)?.into_iter().map(|x| (x.key, x.value)).collect())
    }
}

#[test]
fn test_vecmap_jump_arms() {
    let mut v = VecMap::<&str, i32>::new();
    assert!(v.is_empty());
    assert!(v.iter().next().is_none());

    assert_eq!(v.insert("orange", 40), None);
    assert_eq!(v.insert("apple", 12), None);
    assert_eq!(v.insert("pear", -6), None);
    assert_eq!(v.len(), 3);
    assert_eq!(v.iter().map(|x| (*x.0, *x.1)).collect::<Vec<_>>(), [("apple", 12), ("orange", 40), ("pear", -6)]);

    assert_eq!(v.insert("orange", 41), Some(40));
    assert_eq!(v.len(), 3);
    assert_eq!(v.get("orange"), Some(&41));
    assert_eq!(v.get("kiwi"), None);

    for value in v.values_mut() {
        *value -= 1;
    }
    assert_eq!(v.iter().map(|x| (*x.0, *x.1)).collect::<Vec<_>>(), [("apple", 11), ("orange", 40), ("pear", -7)]);

    let collected: VecMap<&str, i32> = [("b", 2), ("a", 1), ("b", 3)].into_iter().collect();
    assert_eq!(collected.iter().map(|x| (*x.0, *x.1)).collect::<Vec<_>>(), [("a", 1), ("b", 3)]);
}

#[cfg(feature = "cli")]
#[test]
fn test_vecmap_deserialize_unsorted() {
    let v: VecMap<String, i32> = serde_json::from_str(r#"[{"key":"b","value":2},{"key":"a","value":1},{"key":"b","value":3}]"#).unwrap();
    assert_eq!(v.iter().map(|x| (x.0.as_str(), *x.1)).collect::<Vec<_>>(), [("a", 1), ("b", 3)]);
    assert_eq!(v.get("b"), Some(&3));
    assert_eq!(v.get("a"), Some(&1));
    assert_eq!(serde_json::to_string(&v).unwrap(), r#"[{"key":"a","value":1},{"key":"b","value":3}]"#);
}
