//! Identifier-keyed collections.

use std::collections::BTreeMap;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A value with a stable identifier.
pub trait Keyed {
    fn key(&self) -> Uuid;
}

/// A set of values keyed by their identifier.
///
/// Serialized as a plain JSON array; iteration order is by key so two sets
/// with the same members always compare and serialize identically.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedSet<T> {
    items: BTreeMap<Uuid, T>,
}

impl<T> Default for KeyedSet<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T: Keyed> KeyedSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &Uuid) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &Uuid) -> Option<&T> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &Uuid) -> Option<&mut T> {
        self.items.get_mut(key)
    }

    /// Insert a value, returning the previous value with the same key.
    pub fn insert(&mut self, value: T) -> Option<T> {
        self.items.insert(value.key(), value)
    }

    pub fn remove(&mut self, key: &Uuid) -> Option<T> {
        self.items.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.items.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.items.retain(|_, v| keep(v));
    }
}

impl<T: Keyed> FromIterator<T> for KeyedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().map(|v| (v.key(), v)).collect(),
        }
    }
}

impl<T> IntoIterator for KeyedSet<T> {
    type Item = T;
    type IntoIter = std::collections::btree_map::IntoValues<Uuid, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_values()
    }
}

impl<T: Serialize> Serialize for KeyedSet<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.values())
    }
}

impl<'de, T: Keyed + Deserialize<'de>> Deserialize<'de> for KeyedSet<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<T>::deserialize(deserializer)?;
        Ok(items.into_iter().collect())
    }
}
