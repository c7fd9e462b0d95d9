// src/cache/lru.rs
//! Size-bounded LRU index
//!
//! An ordered map from string keys to sized values, enforcing a total-byte
//! budget. Inserting past the budget evicts least-recently-used entries and
//! runs the eviction callback for each, synchronously, on the inserting
//! thread. The index is not internally synchronized; the disk engine holds
//! a single mutex around every operation.

use linked_hash_map::LinkedHashMap;

/// A value with a byte size the index can account for
pub trait SizedValue {
    /// Size in bytes; non-negative
    fn size(&self) -> i64;
}

/// Callback invoked for each capacity eviction, with the index lock held.
///
/// The callback must not call back into the index.
pub type EvictionCallback<V> = Box<dyn Fn(&str, &V) + Send>;

/// LRU index with a byte budget.
///
/// Iteration order is recency order: the front of the map is the eviction
/// candidate, touched entries move to the back.
pub struct SizedLru<V: SizedValue> {
    entries: LinkedHashMap<String, V>,
    max_size: i64,
    current_size: i64,
    on_evict: Option<EvictionCallback<V>>,
}

impl<V: SizedValue> SizedLru<V> {
    /// Create an index holding at most `max_size` bytes
    pub fn new(max_size: i64, on_evict: Option<EvictionCallback<V>>) -> Self {
        Self {
            entries: LinkedHashMap::new(),
            max_size,
            current_size: 0,
            on_evict,
        }
    }

    /// Insert `value` at the most-recently-used end, evicting from the
    /// least-recently-used end as needed to stay within budget.
    ///
    /// An existing entry under `key` is replaced: its size is subtracted but
    /// the eviction callback is not invoked for the overwrite. Returns false,
    /// without inserting, if `value` alone exceeds the budget; note that a
    /// replaced entry stays removed in that case.
    pub fn add(&mut self, key: &str, value: V) -> bool {
        if let Some(prev) = self.entries.remove(key) {
            self.current_size -= prev.size();
        }

        // A value that can never fit must not drain the cache trying.
        if value.size() > self.max_size {
            return false;
        }

        while self.current_size + value.size() > self.max_size {
            match self.entries.pop_front() {
                Some((evicted_key, evicted)) => {
                    self.current_size -= evicted.size();
                    if let Some(cb) = &self.on_evict {
                        cb(&evicted_key, &evicted);
                    }
                }
                None => break,
            }
        }

        self.current_size += value.size();
        self.entries.insert(key.to_string(), value);
        true
    }

    /// Look up `key`, marking it most-recently-used on success
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.entries.get_refresh(key).map(|v| &*v)
    }

    /// Mutable lookup that does not change recency order.
    ///
    /// Used to flip an entry's committed flag at upload commit without
    /// reordering it.
    pub fn peek_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Remove `key` if present, subtracting its size.
    ///
    /// This is an explicit, non-capacity removal: the eviction callback is
    /// not invoked.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.entries.remove(key);
        if let Some(v) = &removed {
            self.current_size -= v.size();
        }
        removed
    }

    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    pub fn current_size(&self) -> i64 {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Item(i64);

    impl SizedValue for Item {
        fn size(&self) -> i64 {
            self.0
        }
    }

    fn counting_callback() -> (Arc<AtomicUsize>, EvictionCallback<Item>) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = count.clone();
        let cb: EvictionCallback<Item> = Box::new(move |_key, _item| {
            cb_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, cb)
    }

    #[test]
    fn test_add_within_budget() {
        let mut lru = SizedLru::new(10, None);
        assert!(lru.add("a", Item(4)));
        assert!(lru.add("b", Item(6)));
        assert_eq!(lru.current_size(), 10);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (evictions, cb) = counting_callback();
        let mut lru = SizedLru::new(2, Some(cb));
        assert!(lru.add("a", Item(1)));
        assert!(lru.add("b", Item(1)));

        // "a" is the oldest; inserting "c" must push it out.
        assert!(lru.add("c", Item(1)));
        assert!(lru.get("a").is_none());
        assert!(lru.get("b").is_some());
        assert!(lru.get("c").is_some());
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(lru.current_size(), 2);
    }

    #[test]
    fn test_get_refreshes_order() {
        let mut lru = SizedLru::new(2, None);
        lru.add("a", Item(1));
        lru.add("b", Item(1));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(lru.get("a").is_some());
        lru.add("c", Item(1));
        assert!(lru.get("a").is_some());
        assert!(lru.get("b").is_none());
    }

    #[test]
    fn test_peek_mut_keeps_order() {
        let mut lru = SizedLru::new(2, None);
        lru.add("a", Item(1));
        lru.add("b", Item(1));

        // peek_mut must not rescue "a" from eviction.
        assert!(lru.peek_mut("a").is_some());
        lru.add("c", Item(1));
        assert!(lru.get("a").is_none());
    }

    #[test]
    fn test_overwrite_skips_callback() {
        let (evictions, cb) = counting_callback();
        let mut lru = SizedLru::new(10, Some(cb));
        lru.add("a", Item(4));
        assert!(lru.add("a", Item(6)));
        assert_eq!(lru.current_size(), 6);
        assert_eq!(lru.len(), 1);
        assert_eq!(evictions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_skips_callback() {
        let (evictions, cb) = counting_callback();
        let mut lru = SizedLru::new(10, Some(cb));
        lru.add("a", Item(4));
        assert!(lru.remove("a").is_some());
        assert!(lru.remove("a").is_none());
        assert_eq!(lru.current_size(), 0);
        assert_eq!(evictions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejects_oversized_item() {
        let (evictions, cb) = counting_callback();
        let mut lru = SizedLru::new(5, Some(cb));
        lru.add("a", Item(3));

        // The doomed insert must not evict anything on its way to failing.
        assert!(!lru.add("big", Item(6)));
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.current_size(), 3);
        assert_eq!(evictions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_eviction_cascade() {
        let (evictions, cb) = counting_callback();
        let mut lru = SizedLru::new(10, Some(cb));
        lru.add("a", Item(4));
        lru.add("b", Item(4));

        // 8 + 9 > 10: both residents must go.
        assert!(lru.add("c", Item(9)));
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.current_size(), 9);
        assert_eq!(evictions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_size_accounting_invariant() {
        let mut lru = SizedLru::new(100, None);
        lru.add("a", Item(10));
        lru.add("b", Item(20));
        lru.add("a", Item(5));
        lru.remove("b");
        assert_eq!(lru.current_size(), 5);
        assert!(lru.current_size() <= lru.max_size());
    }
}
