// File: src/collections.rs
//
// Script-visible map and set storage. Keys are compared by structural
// equality, which for string keys requires heap access, so the hash and
// the equality predicate are supplied by the caller (the heap computes
// both). Buckets are chained entry indices; the bucket array doubles
// when occupancy passes the load factor.

const LOAD_FACTOR: f64 = 0.75;
const INITIAL_BUCKETS: usize = 8;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub hash: u64,
    pub key: Value,
    pub value: Value,
}

/// Hash map from value to value, insertion-ordered iteration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptMap {
    buckets: Vec<Vec<u32>>,
    entries: Vec<MapEntry>,
}

impl ScriptMap {
    pub fn new() -> Self {
        Self { buckets: Vec::new(), entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Find the value for a key. `key_eq` is called with candidate keys
    /// whose hash matched.
    pub fn get(&self, hash: u64, mut key_eq: impl FnMut(&Value) -> bool) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = self.bucket_of(hash);
        for &idx in &self.buckets[bucket] {
            let entry = &self.entries[idx as usize];
            if entry.hash == hash && key_eq(&entry.key) {
                return Some(entry.value);
            }
        }
        None
    }

    /// Insert or update. Returns true when the key was new.
    pub fn insert(
        &mut self,
        hash: u64,
        key: Value,
        value: Value,
        mut key_eq: impl FnMut(&Value) -> bool,
    ) -> bool {
        if self.buckets.is_empty() {
            self.buckets = vec![Vec::new(); INITIAL_BUCKETS];
        }
        let bucket = self.bucket_of(hash);
        for &idx in &self.buckets[bucket] {
            let entry = &mut self.entries[idx as usize];
            if entry.hash == hash && key_eq(&entry.key) {
                entry.value = value;
                return false;
            }
        }

        let idx = self.entries.len() as u32;
        self.entries.push(MapEntry { hash, key, value });
        self.buckets[bucket].push(idx);

        if self.entries.len() as f64 > self.buckets.len() as f64 * LOAD_FACTOR {
            self.grow();
        }
        true
    }

    fn grow(&mut self) {
        let new_size = (self.buckets.len() * 2).max(INITIAL_BUCKETS);
        let mut buckets = vec![Vec::new(); new_size];
        for (idx, entry) in self.entries.iter().enumerate() {
            let bucket = (entry.hash as usize) & (new_size - 1);
            buckets[bucket].push(idx as u32);
        }
        self.buckets = buckets;
    }

    /// Approximate payload size in bytes, used for the GC watermark
    pub fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<MapEntry>()
            + self.buckets.iter().map(|b| b.len() * 4).sum::<usize>()
    }
}

/// Set of values with the same key rules as map keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptSet {
    buckets: Vec<Vec<u32>>,
    items: Vec<(u64, Value)>,
}

impl ScriptSet {
    pub fn new() -> Self {
        Self { buckets: Vec::new(), items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &Value> {
        self.items.iter().map(|(_, v)| v)
    }

    pub fn contains(&self, hash: u64, mut item_eq: impl FnMut(&Value) -> bool) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        let bucket = (hash as usize) & (self.buckets.len() - 1);
        self.buckets[bucket]
            .iter()
            .any(|&idx| self.items[idx as usize].0 == hash && item_eq(&self.items[idx as usize].1))
    }

    /// Add an item. Returns true when it was not already present.
    pub fn add(&mut self, hash: u64, item: Value, mut item_eq: impl FnMut(&Value) -> bool) -> bool {
        if self.buckets.is_empty() {
            self.buckets = vec![Vec::new(); INITIAL_BUCKETS];
        }
        let bucket = (hash as usize) & (self.buckets.len() - 1);
        for &idx in &self.buckets[bucket] {
            let (h, ref v) = self.items[idx as usize];
            if h == hash && item_eq(v) {
                return false;
            }
        }

        let idx = self.items.len() as u32;
        self.items.push((hash, item));
        self.buckets[bucket].push(idx);

        if self.items.len() as f64 > self.buckets.len() as f64 * LOAD_FACTOR {
            self.grow();
        }
        true
    }

    fn grow(&mut self) {
        let new_size = (self.buckets.len() * 2).max(INITIAL_BUCKETS);
        let mut buckets = vec![Vec::new(); new_size];
        for (idx, (hash, _)) in self.items.iter().enumerate() {
            let bucket = (*hash as usize) & (new_size - 1);
            buckets[bucket].push(idx as u32);
        }
        self.buckets = buckets;
    }

    pub fn byte_size(&self) -> usize {
        self.items.len() * std::mem::size_of::<(u64, Value)>()
            + self.buckets.iter().map(|b| b.len() * 4).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num_eq(n: f64) -> impl FnMut(&Value) -> bool {
        move |v| matches!(v, Value::Number(m) if *m == n)
    }

    fn hash_of(n: f64) -> u64 {
        // Tests hash by bit pattern; the heap's real hasher does the same
        // for numbers after normalizing -0.0.
        n.to_bits()
    }

    #[test]
    fn test_map_insert_get_update() {
        let mut map = ScriptMap::new();
        assert!(map.insert(hash_of(1.0), Value::Number(1.0), Value::Bool(true), num_eq(1.0)));
        assert!(!map.insert(hash_of(1.0), Value::Number(1.0), Value::Bool(false), num_eq(1.0)));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(hash_of(1.0), num_eq(1.0)), Some(Value::Bool(false)));
        assert_eq!(map.get(hash_of(2.0), num_eq(2.0)), None);
    }

    #[test]
    fn test_map_grows_past_load_factor() {
        let mut map = ScriptMap::new();
        for i in 0..100 {
            let n = i as f64;
            map.insert(hash_of(n), Value::Number(n), Value::Number(n * 2.0), num_eq(n));
        }
        assert_eq!(map.len(), 100);
        for i in 0..100 {
            let n = i as f64;
            assert_eq!(map.get(hash_of(n), num_eq(n)), Some(Value::Number(n * 2.0)));
        }
    }

    #[test]
    fn test_map_preserves_insertion_order() {
        let mut map = ScriptMap::new();
        for n in [3.0, 1.0, 2.0] {
            map.insert(hash_of(n), Value::Number(n), Value::Nil, num_eq(n));
        }
        let keys: Vec<f64> =
            map.entries().iter().filter_map(|e| e.key.as_number()).collect();
        assert_eq!(keys, vec![3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_set_add_contains() {
        let mut set = ScriptSet::new();
        assert!(set.add(hash_of(5.0), Value::Number(5.0), num_eq(5.0)));
        assert!(!set.add(hash_of(5.0), Value::Number(5.0), num_eq(5.0)));
        assert!(set.contains(hash_of(5.0), num_eq(5.0)));
        assert!(!set.contains(hash_of(6.0), num_eq(6.0)));
        assert_eq!(set.len(), 1);
    }
}
