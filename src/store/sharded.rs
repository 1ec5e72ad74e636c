//! ShardedStore implementation
//!
//! Fixed array of `RwLock<HashMap>` shards plus an atomic live-key counter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;

use super::guard::{ShardReadGuard, ShardWriteGuard, StoreWriteGuard};
use super::{compute_capacity, fnv32, MIN_SHARDS};

pub(super) type ShardMap<V> = HashMap<Vec<u8>, V>;

/// Concurrency-safe key-value map using lock striping
///
/// ## Concurrency:
/// - Each shard has its own `RwLock`; unrelated keys never contend
/// - `count` is only changed while the owning shard's write lock is held
/// - `len()` never takes a lock
///
/// ## Iteration
/// `for_each` visits one shard at a time under that shard's read lock. It is
/// not a snapshot: inserts into shards not yet visited are seen, inserts into
/// shards already visited are not.
pub struct ShardedStore<V> {
    shards: Box<[RwLock<ShardMap<V>>]>,
    pub(super) count: AtomicUsize,
}

impl<V> ShardedStore<V> {
    /// Create a store with at least `shard_count` shards (rounded up to a power of two, min 16)
    pub fn new(shard_count: usize) -> Self {
        let shard_count = compute_capacity(shard_count);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            count: AtomicUsize::new(0),
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard owning `key`
    pub fn shard_index(&self, key: &[u8]) -> usize {
        (fnv32(key) as usize) & (self.shards.len() - 1)
    }

    // =========================================================================
    // Self-locking operations
    // =========================================================================

    /// Get a clone of the value bound to `key` (shared lock)
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        self.read(key).get(key).cloned()
    }

    /// Run `f` against the value bound to `key` without cloning it (shared lock)
    pub fn get_with<R>(&self, key: &[u8], f: impl FnOnce(&V) -> R) -> Option<R> {
        self.read(key).get(key).map(f)
    }

    /// Whether `key` is present (shared lock)
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.read(key).contains_key(key)
    }

    /// Insert or overwrite. Returns 1 if the key was created, 0 if overwritten.
    pub fn put(&self, key: &[u8], value: V) -> usize {
        self.lock(key).put(key, value)
    }

    /// Insert only if absent. Returns 1 if inserted.
    pub fn put_if_absent(&self, key: &[u8], value: V) -> usize {
        self.lock(key).put_if_absent(key, value)
    }

    /// Overwrite only if present. Returns 1 if updated.
    pub fn put_if_present(&self, key: &[u8], value: V) -> usize {
        self.lock(key).put_if_present(key, value)
    }

    /// Remove `key`. Returns 1 if it existed.
    pub fn remove(&self, key: &[u8]) -> usize {
        self.lock(key).remove(key)
    }

    /// Remove `key` and hand back its value
    pub fn take(&self, key: &[u8]) -> Option<V> {
        self.lock(key).take(key)
    }

    /// Number of live keys (lock-free)
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry until the visitor returns `false`
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&[u8], &V) -> bool,
    {
        for shard in self.shards.iter() {
            let map = shard.read();
            for (key, value) in map.iter() {
                if !visitor(key, value) {
                    return;
                }
            }
        }
    }

    /// All keys currently in the store
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.to_vec());
            true
        });
        keys
    }

    /// Up to `limit` randomly chosen keys; the same key may appear more than once
    pub fn random_keys(&self, limit: usize) -> Vec<Vec<u8>> {
        let mut result = Vec::with_capacity(limit.min(self.len()));
        let mut rng = rand::thread_rng();

        while result.len() < limit && !self.is_empty() {
            let shard = &self.shards[rng.gen_range(0..self.shards.len())];
            if let Some(key) = random_key(&shard.read(), &mut rng) {
                result.push(key);
            }
        }
        result
    }

    /// Up to `limit` distinct randomly chosen keys
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<Vec<u8>> {
        if limit >= self.len() {
            return self.keys();
        }

        let mut picked = HashSet::with_capacity(limit);
        let mut rng = rand::thread_rng();

        // Concurrent removals can shrink the store below `limit`
        while picked.len() < limit && picked.len() < self.len() {
            let shard = &self.shards[rng.gen_range(0..self.shards.len())];
            if let Some(key) = random_key(&shard.read(), &mut rng) {
                picked.insert(key);
            }
        }
        picked.into_iter().collect()
    }

    /// Remove every entry with all shards locked at once
    pub fn clear(&self) {
        self.lock_all().clear();
    }

    // =========================================================================
    // Caller-holds-the-lock access
    // =========================================================================

    /// Take the exclusive lock of the shard owning `key`.
    ///
    /// Every mutation made through the guard happens inside this one critical
    /// section, so callers can pair a store change with other work (such as an
    /// AOF append) without re-locking.
    pub fn lock(&self, key: &[u8]) -> ShardWriteGuard<'_, V> {
        let index = self.shard_index(key);
        ShardWriteGuard::new(self, index, self.shards[index].write())
    }

    /// Take the exclusive lock of every shard, in index order.
    ///
    /// Blocks until all in-flight single-shard operations have finished.
    pub fn lock_all(&self) -> StoreWriteGuard<'_, V> {
        let maps = self.shards.iter().map(|shard| shard.write()).collect();
        StoreWriteGuard::new(self, maps)
    }

    /// Take the shared lock of the shard owning `key`
    pub fn read(&self, key: &[u8]) -> ShardReadGuard<'_, V> {
        let index = self.shard_index(key);
        ShardReadGuard::new(self, index, self.shards[index].read())
    }
}

impl<V> Default for ShardedStore<V> {
    fn default() -> Self {
        Self::new(MIN_SHARDS)
    }
}

fn random_key<V, R: Rng>(map: &ShardMap<V>, rng: &mut R) -> Option<Vec<u8>> {
    if map.is_empty() {
        return None;
    }
    let nth = rng.gen_range(0..map.len());
    map.keys().nth(nth).cloned()
}
