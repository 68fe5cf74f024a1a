use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash};

use parking_lot::Mutex;

/// Bounded concurrent map with pure insertion-order FIFO eviction.
///
/// Keys are partitioned over `shards` independently locked shards by hash;
/// each shard holds at most `capacity / shards` entries and evicts its
/// oldest-inserted key when full. Reads never refresh recency, and
/// overwriting an existing key keeps its original queue slot, so an entry's
/// lifetime depends only on how many distinct keys were inserted after it
/// into the same shard. Eviction is silent: an evicted entry is gone for
/// good, and callers that depended on it simply miss.
pub struct FifoShardMap<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    hasher: ahash::RandomState,
}

struct Shard<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K, V> FifoShardMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = (capacity / shards).max(1);
        Self {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(Shard {
                        map: HashMap::with_capacity(per_shard),
                        order: VecDeque::with_capacity(per_shard),
                        capacity: per_shard,
                    })
                })
                .collect(),
            hasher: ahash::RandomState::new(),
        }
    }

    fn shard_for<Q>(&self, key: &Q) -> &Mutex<Shard<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let h = self.hasher.hash_one(key);
        &self.shards[h as usize % self.shards.len()]
    }

    /// Insert or overwrite. A new key landing in a full shard evicts that
    /// shard's oldest-inserted key first.
    pub fn put(&self, key: K, value: V) {
        let mut shard = self.shard_for(&key).lock();
        if shard.map.contains_key(&key) {
            shard.map.insert(key, value);
            return;
        }
        if shard.order.len() >= shard.capacity {
            if let Some(oldest) = shard.order.pop_front() {
                shard.map.remove(&oldest);
            }
        }
        shard.order.push_back(key.clone());
        shard.map.insert(key, value);
    }

    /// Non-destructive lookup.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).lock().map.get(key).cloned()
    }

    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).lock().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_evicts_oldest_in_single_shard() {
        let map = FifoShardMap::new(4, 1);
        for i in 0..4 {
            map.put(format!("k{i}"), i);
        }
        map.put("k4".to_string(), 4);

        assert!(!map.has("k0"));
        for i in 1..=4 {
            assert_eq!(map.get(&format!("k{i}")), Some(i));
        }
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn overwrite_keeps_original_queue_slot() {
        let map = FifoShardMap::new(2, 1);
        map.put("a".to_string(), 1);
        map.put("b".to_string(), 2);
        map.put("a".to_string(), 10);
        assert_eq!(map.get("a"), Some(10));
        assert_eq!(map.len(), 2);

        // "a" is still the oldest insertion, so the next new key evicts it.
        map.put("c".to_string(), 3);
        assert!(!map.has("a"));
        assert!(map.has("b"));
        assert!(map.has("c"));
    }

    #[test]
    fn total_size_is_bounded_by_capacity() {
        let map = FifoShardMap::new(8, 2);
        for i in 0..256 {
            map.put(format!("k{i}"), i);
        }
        assert_eq!(map.len(), 8);
    }

    #[test]
    fn concurrent_puts_and_gets_stay_bounded() {
        let map = Arc::new(FifoShardMap::new(64, 2));
        let mut handles = Vec::new();
        for t in 0..4 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000 {
                    let key = format!("t{t}-{i}");
                    map.put(key.clone(), i as i64);
                    let _ = map.get(&key);
                    let _ = map.has(&format!("t{}-{}", (t + 1) % 4, i));
                }
            }));
        }
        for h in handles {
            h.join().expect("worker panicked");
        }
        assert!(map.len() <= 64);
    }
}
