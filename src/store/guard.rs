//! Shard guards
//!
//! Lock guards scoped to a single shard. Holding one is the proof that the
//! shard is already locked, so the guard's methods never lock again.

use std::sync::atomic::Ordering;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use super::sharded::{ShardMap, ShardedStore};

/// Exclusive access to one shard
pub struct ShardWriteGuard<'a, V> {
    store: &'a ShardedStore<V>,
    index: usize,
    map: RwLockWriteGuard<'a, ShardMap<V>>,
}

impl<'a, V> ShardWriteGuard<'a, V> {
    pub(super) fn new(
        store: &'a ShardedStore<V>,
        index: usize,
        map: RwLockWriteGuard<'a, ShardMap<V>>,
    ) -> Self {
        Self { store, index, map }
    }

    /// Index of the locked shard
    pub fn shard_index(&self) -> usize {
        self.index
    }

    /// Panics if `key` hashes to another shard
    fn check_owner(&self, key: &[u8]) {
        let owner = self.store.shard_index(key);
        assert_eq!(
            owner, self.index,
            "key hashes to shard {} but shard {} is locked",
            owner, self.index
        );
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.check_owner(key);
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        self.check_owner(key);
        self.map.get_mut(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.check_owner(key);
        self.map.contains_key(key)
    }

    /// Insert or overwrite. Returns 1 if the key was created.
    pub fn put(&mut self, key: &[u8], value: V) -> usize {
        self.check_owner(key);
        if let Some(slot) = self.map.get_mut(key) {
            *slot = value;
            return 0;
        }
        self.map.insert(key.to_vec(), value);
        self.store.count.fetch_add(1, Ordering::AcqRel);
        1
    }

    /// Insert only if absent. Returns 1 if inserted.
    pub fn put_if_absent(&mut self, key: &[u8], value: V) -> usize {
        self.check_owner(key);
        if self.map.contains_key(key) {
            return 0;
        }
        self.map.insert(key.to_vec(), value);
        self.store.count.fetch_add(1, Ordering::AcqRel);
        1
    }

    /// Overwrite only if present. Returns 1 if updated.
    pub fn put_if_present(&mut self, key: &[u8], value: V) -> usize {
        self.check_owner(key);
        match self.map.get_mut(key) {
            Some(slot) => {
                *slot = value;
                1
            }
            None => 0,
        }
    }

    /// Remove `key`. Returns 1 if it existed.
    pub fn remove(&mut self, key: &[u8]) -> usize {
        self.take(key).map_or(0, |_| 1)
    }

    /// Remove `key` and hand back its value
    pub fn take(&mut self, key: &[u8]) -> Option<V> {
        self.check_owner(key);
        let value = self.map.remove(key)?;
        self.store.count.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    /// Entries in this shard
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Exclusive access to every shard at once
///
/// Shard locks are taken in index order, the only order any caller holds
/// more than one of them in.
pub struct StoreWriteGuard<'a, V> {
    store: &'a ShardedStore<V>,
    maps: Vec<RwLockWriteGuard<'a, ShardMap<V>>>,
}

impl<'a, V> StoreWriteGuard<'a, V> {
    pub(super) fn new(
        store: &'a ShardedStore<V>,
        maps: Vec<RwLockWriteGuard<'a, ShardMap<V>>>,
    ) -> Self {
        Self { store, maps }
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let mut removed = 0;
        for map in self.maps.iter_mut() {
            removed += map.len();
            map.clear();
        }
        self.store.count.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    /// Entries across all shards
    pub fn len(&self) -> usize {
        self.maps.iter().map(|map| map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(|map| map.is_empty())
    }
}

/// Shared access to one shard
pub struct ShardReadGuard<'a, V> {
    store: &'a ShardedStore<V>,
    index: usize,
    map: RwLockReadGuard<'a, ShardMap<V>>,
}

impl<'a, V> ShardReadGuard<'a, V> {
    pub(super) fn new(
        store: &'a ShardedStore<V>,
        index: usize,
        map: RwLockReadGuard<'a, ShardMap<V>>,
    ) -> Self {
        Self { store, index, map }
    }

    pub fn shard_index(&self) -> usize {
        self.index
    }

    fn check_owner(&self, key: &[u8]) {
        let owner = self.store.shard_index(key);
        assert_eq!(
            owner, self.index,
            "key hashes to shard {} but shard {} is locked",
            owner, self.index
        );
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.check_owner(key);
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.check_owner(key);
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
