//! Fixed-size lock striping for the relay's keyed state.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard};

/// A string-keyed map split across independently locked shards.
///
/// Each operation locks exactly one shard, except the whole-map walks, which
/// lock shards one at a time.
pub struct ShardedMap<V> {
    hasher: RandomState,
    shards: Vec<Mutex<HashMap<String, V>>>,
}

impl<V> ShardedMap<V> {
    /// Create a map with `shard_count` shards (at least one)
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            hasher: RandomState::new(),
            shards,
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Run `f` with the shard that owns `key` locked
    pub fn with_shard<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, V>) -> R) -> R {
        let index = self.index_of(key);
        f(&mut lock(&self.shards[index]))
    }

    /// Run `f` on every shard in turn
    pub fn for_each_shard(&self, mut f: impl FnMut(&mut HashMap<String, V>)) {
        for shard in &self.shards {
            f(&mut lock(shard));
        }
    }

    /// Total entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    /// Whether every shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_of(&self, key: &str) -> usize {
        // The modulo keeps the value below `shards.len()`, so the cast is lossless.
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }
}

fn lock<V>(shard: &Mutex<HashMap<String, V>>) -> MutexGuard<'_, HashMap<String, V>> {
    shard.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_land_in_one_shard() {
        let map = ShardedMap::new(4);
        for i in 0..64 {
            map.with_shard(&format!("k{i}"), |shard| shard.insert(format!("k{i}"), i));
        }
        assert_eq!(map.len(), 64);

        let mut seen = 0;
        map.for_each_shard(|shard| seen += shard.len());
        assert_eq!(seen, 64);
        assert_eq!(map.with_shard("k7", |shard| shard.get("k7").copied()), Some(7));
    }

    #[test]
    fn test_zero_shards_falls_back_to_one() {
        let map: ShardedMap<u8> = ShardedMap::new(0);
        assert_eq!(map.shard_count(), 1);
        assert!(map.is_empty());
    }
}
