//! Sharded concurrent map.
//!
//! No example repo in the reference pack partitions its dialog table —
//! the teacher keeps a single `RwLock<HashMap<DialogId, Dialog>>` behind
//! its `DialogLayer`. spec.md §4.2 requires fixed-shard, FNV-hashed
//! storage so that lock contention under concurrent dialog churn is
//! bounded by shard count rather than by a single global lock; this
//! module is grounded on that requirement plus the partitioning shape
//! used by `DashMap` in the pack's `dialog-core` crate (one `RwLock` per
//! bucket, computed from a hash of the key).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of shards. Fixed at compile time per spec.md §4.2; chosen as a
/// power of two so the modulo reduces to a mask.
pub const SHARD_COUNT: usize = 32;

/// FNV-1a, the same non-cryptographic hash the spec names explicitly for
/// shard selection (stable across process restarts, unlike `RandomState`,
/// which matters for reproducible shard distribution in tests).
struct FnvHasher(u64);

impl FnvHasher {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    fn new() -> Self {
        FnvHasher(Self::OFFSET)
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }
}

fn shard_index<K: Hash>(key: &K) -> usize {
    let mut hasher = FnvHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) & (SHARD_COUNT - 1)
}

struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

/// A `HashMap` partitioned into [`SHARD_COUNT`] independently-locked
/// shards. Two operations on keys in different shards never contend;
/// operations on the same shard serialize through that shard's
/// `RwLock`, same as a plain map would.
pub struct ShardedMap<K, V> {
    shards: Vec<Shard<K, V>>,
}

impl<K, V> Default for ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Shard {
                map: RwLock::new(HashMap::new()),
            });
        }
        Self { shards }
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[shard_index(key)]
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).map.write().unwrap().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).map.write().unwrap().remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).map.read().unwrap().contains_key(key)
    }

    /// Applies `f` to a read-locked reference to the value, avoiding a
    /// clone for types that are expensive to copy (e.g. a `Dialog`
    /// wrapped in an `Arc` is cheap, but this keeps the API honest for
    /// any `V`).
    pub fn with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(key).map.read().unwrap().get(key).map(f)
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).map.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` once per entry across every shard. Each shard is
    /// read-locked only for the duration of its own iteration, so a slow
    /// callback on one shard doesn't block writers on another.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for shard in &self.shards {
            let guard = shard.map.read().unwrap();
            for (k, v) in guard.iter() {
                f(k, v);
            }
        }
    }

    /// Collects every entry matching `pred` into a `Vec`, useful when the
    /// caller needs owned copies to act on outside any lock (spec.md's
    /// "never call back into application code while holding a dialog
    /// lock" rule).
    pub fn find_all(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        self.for_each(|k, v| {
            if pred(k, v) {
                out.push((k.clone(), v.clone()));
            }
        });
        out
    }

    /// Moves the entry at `old` to `new`, atomically from the caller's
    /// perspective: the old shard's write lock is held only long enough
    /// to remove the value, then released before the new shard's write
    /// lock is acquired, so a rekey never holds two shard locks at once
    /// (spec.md §4.2's deadlock-avoidance requirement). Returns `false`
    /// if `old` was not present.
    pub fn rekey(&self, old: &K, new: K) -> bool {
        let value = {
            let shard = self.shard(old);
            let mut guard = shard.map.write().unwrap();
            guard.remove(old)
        };
        match value {
            Some(v) => {
                self.insert(new, v);
                true
            }
            None => false,
        }
    }

    fn read_shard(&self, key: &K) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.shard(key).map.read().unwrap()
    }

    fn write_shard(&self, key: &K) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.shard(key).map.write().unwrap()
    }

    /// Read-locks the shard for `key` and runs `f` against the whole
    /// shard's contents, useful for the dialog layer's tag-swap lookup
    /// chain where multiple candidate keys may land in the same shard.
    pub fn with_shard<R>(&self, key: &K, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        f(&self.read_shard(key))
    }

    pub fn with_shard_mut<R>(&self, key: &K, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        f(&mut self.write_shard(key))
    }
}
