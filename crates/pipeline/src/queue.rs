use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::FxHashMap;

/// Coalescing FIFO keyed by identity with a fixed capacity.
///
/// Pushing a key that is already queued keeps its position and merges the values.
/// When full, the oldest key is evicted and counted as dropped.
pub struct Coalescer<K, V> {
    /// Value plus the sequence number of the key's live slot in `order`.
    map: FxHashMap<K, (V, u64)>,
    order: VecDeque<(K, u64)>,
    next_seq: u64,
    cap: usize,
    dropped: u64,
}

impl<K: Hash + Eq + Clone, V> Coalescer<K, V> {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), next_seq: 0, cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn dropped(&self) -> u64 { self.dropped }

    /// Queue `value` for `key`, merging into an existing entry with `merge(existing, new)`.
    /// Returns the evicted key when the queue overflowed.
    pub fn push_with<F>(&mut self, key: K, value: V, merge: F) -> Option<K>
    where
        F: FnOnce(&mut V, V),
    {
        if let Some((existing, _)) = self.map.get_mut(&key) {
            merge(existing, value);
            return None;
        }
        let mut evicted = None;
        while self.order.len() >= self.cap {
            let Some((old, seq)) = self.order.pop_front() else { break };
            if self.take_live(&old, seq).is_some() {
                self.dropped += 1;
                evicted = Some(old);
                break;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((key.clone(), seq));
        self.map.insert(key, (value, seq));
        evicted
    }

    pub fn pop_front(&mut self) -> Option<(K, V)> {
        while let Some((key, seq)) = self.order.pop_front() {
            if let Some(v) = self.take_live(&key, seq) {
                return Some((key, v));
            }
        }
        None
    }

    /// Forget a queued key. Its old slot in the order goes stale and is skipped;
    /// pushing the key again queues it at the back.
    pub fn remove(&mut self, key: &K) -> Option<V> { self.map.remove(key).map(|(v, _)| v) }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn take_live(&mut self, key: &K, seq: u64) -> Option<V> {
        if self.map.get(key).map(|(_, live)| *live) != Some(seq) {
            return None;
        }
        self.map.remove(key).map(|(v, _)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep_max(a: &mut u32, b: u32) { *a = (*a).max(b); }

    #[test]
    fn coalesces_in_fifo_order() {
        let mut q: Coalescer<&str, u32> = Coalescer::with_capacity(8);
        q.push_with("a", 1, keep_max);
        q.push_with("b", 1, keep_max);
        q.push_with("a", 5, keep_max);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_front(), Some(("a", 5)));
        assert_eq!(q.pop_front(), Some(("b", 1)));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut q: Coalescer<u32, ()> = Coalescer::with_capacity(2);
        q.push_with(1, (), |_, _| {});
        q.push_with(2, (), |_, _| {});
        assert_eq!(q.push_with(3, (), |_, _| {}), Some(1));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop_front().map(|(k, _)| k), Some(2));
        assert_eq!(q.pop_front().map(|(k, _)| k), Some(3));
    }

    #[test]
    fn removed_keys_are_skipped() {
        let mut q: Coalescer<u32, u32> = Coalescer::with_capacity(4);
        q.push_with(1, 10, |_, _| {});
        q.push_with(2, 20, |_, _| {});
        assert_eq!(q.remove(&1), Some(10));
        assert_eq!(q.pop_front(), Some((2, 20)));
        assert!(q.is_empty());
    }

    #[test]
    fn requeued_key_goes_to_the_back() {
        let mut q: Coalescer<u32, u32> = Coalescer::with_capacity(4);
        q.push_with(1, 10, |_, _| {});
        q.push_with(2, 20, |_, _| {});
        q.remove(&1);
        q.push_with(1, 11, |_, _| {});
        assert_eq!(q.pop_front(), Some((2, 20)));
        assert_eq!(q.pop_front(), Some((1, 11)));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn stale_slots_do_not_count_as_evictions() {
        let mut q: Coalescer<u32, ()> = Coalescer::with_capacity(2);
        q.push_with(1, (), |_, _| {});
        q.remove(&1);
        q.push_with(2, (), |_, _| {});
        assert_eq!(q.push_with(3, (), |_, _| {}), None);
        assert_eq!(q.dropped(), 0);
        assert_eq!(q.len(), 2);
    }
}
