//! Two-way registries for the manager's symbol tables.
//!
//! The manager looks entries up by ID and also answers reverse membership
//! questions about the object instances themselves. The registry keeps a
//! keyed map and a mirrored set of instance uids consistent under insert and
//! remove.

use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;

use indexmap::IndexMap;
use uuid::Uuid;

use crate::error::FabricError;

struct Slot<V> {
    uid: Uuid,
    value: V,
}

/// Keyed store with reverse membership by instance uid.
pub struct Registry<K, V> {
    by_key: IndexMap<K, Slot<V>>,
    uids: HashSet<Uuid>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self {
            by_key: IndexMap::new(),
            uids: HashSet::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Hash + Eq + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Duplicate keys and duplicate instances are rejected.
    pub fn insert(&mut self, key: K, uid: Uuid, value: V) -> Result<(), FabricError> {
        if self.by_key.contains_key(&key) {
            return Err(FabricError::Config(format!(
                "'{key}' is already registered"
            )));
        }
        if !self.uids.insert(uid) {
            return Err(FabricError::Config(format!(
                "instance behind '{key}' is already registered"
            )));
        }
        self.by_key.insert(key, Slot { uid, value });
        Ok(())
    }

    /// Remove an entry by key, keeping both mappings consistent.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.by_key.shift_remove(key)?;
        self.uids.remove(&slot.uid);
        Some(slot.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    /// Reverse membership: is this instance registered under any key?
    pub fn contains_uid(&self, uid: &Uuid) -> bool {
        self.uids.contains(uid)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.by_key.get(key).map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.by_key.get_mut(key).map(|slot| &mut slot.value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.by_key.keys()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.by_key.iter_mut().map(|(k, slot)| (k, &mut slot.value))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
