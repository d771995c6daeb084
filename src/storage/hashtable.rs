//! Robin-Hood Hash Table
//!
//! Open-addressing table with probe-sequence-length bookkeeping, dynamic
//! doubling/halving and backward-shift deletion. Owned and mutated by
//! exactly one task at a time; not internally synchronized.

use std::fmt;
use std::time::SystemTime;

use regex::Regex;

use crate::error::{Error, Result};
use crate::storage::value::{Number, Value};

const INITIAL_CAPACITY: usize = 16;
const DEFAULT_GROW_THRESHOLD: f64 = 0.75;
const DEFAULT_SHRINK_THRESHOLD: f64 = 0.25;

/// A key-value pair in the hash table.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub value: Value,
    pub timestamp: SystemTime,
    /// Probe sequence length: distance from the slot the key hashes to.
    pub psl: u32,
}

/// Robin-Hood hash table with dynamic resizing.
///
/// Capacity is always a power of two, never below 16.
pub struct HashTable {
    buckets: Vec<Option<Entry>>,
    capacity: usize,
    used: usize,
    grow_threshold: f64,
    shrink_threshold: f64,
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTable {
    /// Create a table with default capacity and thresholds.
    pub fn new() -> Self {
        Self::with_options(
            INITIAL_CAPACITY,
            DEFAULT_GROW_THRESHOLD,
            DEFAULT_SHRINK_THRESHOLD,
        )
    }

    /// Create a table with custom parameters. Capacity is rounded up to a
    /// power of two and clamped to at least 16.
    pub fn with_options(capacity: usize, grow_threshold: f64, shrink_threshold: f64) -> Self {
        let capacity = capacity.max(INITIAL_CAPACITY).next_power_of_two();
        Self {
            buckets: vec![None; capacity],
            capacity,
            used: 0,
            grow_threshold,
            shrink_threshold,
        }
    }

    /// Number of live entries.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Current bucket count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_of(&self, key: &str) -> usize {
        // Capacity is a power of two, so masking is the modulo.
        murmur3_32(key.as_bytes(), 0) as usize & (self.capacity - 1)
    }

    // Grow before the insert that would reach the threshold, so the load
    // factor stays below it after every mutation.
    fn should_grow(&self) -> bool {
        (self.used + 1) as f64 / self.capacity as f64 >= self.grow_threshold
    }

    fn should_shrink(&self) -> bool {
        self.capacity > INITIAL_CAPACITY
            && self.used as f64 / self.capacity as f64 <= self.shrink_threshold
    }

    fn resize(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.buckets, vec![None; new_capacity]);
        self.capacity = new_capacity;
        self.used = 0;
        for entry in old.into_iter().flatten() {
            self.insert(entry);
        }
    }

    /// Insert or update a key-value pair. Returns `true` when a new entry
    /// was placed, `false` when an existing key was overwritten.
    pub fn put(&mut self, key: &str, value: Value) -> bool {
        if self.should_grow() {
            self.resize(self.capacity * 2);
        }
        self.insert(Entry {
            key: key.to_string(),
            value,
            timestamp: SystemTime::now(),
            psl: 0,
        })
    }

    fn insert(&mut self, mut entry: Entry) -> bool {
        entry.psl = 0;
        let mask = self.capacity - 1;
        let mut index = self.slot_of(&entry.key);
        loop {
            let slot = &mut self.buckets[index];
            match slot {
                None => {
                    *slot = Some(entry);
                    self.used += 1;
                    return true;
                }
                Some(occupant) if occupant.key == entry.key => {
                    occupant.value = entry.value;
                    occupant.timestamp = entry.timestamp;
                    return false;
                }
                Some(occupant) => {
                    // Rich give to the poor: carry the entry that is
                    // further from home.
                    if entry.psl > occupant.psl {
                        std::mem::swap(occupant, &mut entry);
                    }
                    entry.psl += 1;
                    index = (index + 1) & mask;
                }
            }
        }
    }

    /// Look up a key, returning the value and its write timestamp.
    pub fn get(&self, key: &str) -> Option<(Value, SystemTime)> {
        let mask = self.capacity - 1;
        let mut index = self.slot_of(key);
        let mut probe = 0u32;
        loop {
            match &self.buckets[index] {
                None => return None,
                Some(entry) if probe > entry.psl => return None,
                Some(entry) if entry.key == key => {
                    return Some((entry.value.clone(), entry.timestamp))
                }
                Some(_) => {
                    probe += 1;
                    index = (index + 1) & mask;
                }
            }
        }
    }

    /// Remove a key using backward-shift deletion. Returns `false` when the
    /// key was absent.
    pub fn delete(&mut self, key: &str) -> bool {
        let mask = self.capacity - 1;
        let mut index = self.slot_of(key);
        let mut probe = 0u32;
        loop {
            match &self.buckets[index] {
                None => return false,
                Some(entry) if probe > entry.psl => return false,
                Some(entry) if entry.key == key => {
                    let mut next = (index + 1) & mask;
                    while let Some(follower) = self.buckets[next].as_ref() {
                        if follower.psl == 0 {
                            break;
                        }
                        if let Some(mut moved) = self.buckets[next].take() {
                            moved.psl -= 1;
                            self.buckets[index] = Some(moved);
                        }
                        index = next;
                        next = (next + 1) & mask;
                    }
                    self.buckets[index] = None;
                    self.used -= 1;
                    if self.should_shrink() {
                        self.resize(self.capacity / 2);
                    }
                    return true;
                }
                Some(_) => {
                    probe += 1;
                    index = (index + 1) & mask;
                }
            }
        }
    }

    /// Increment a numeric value. The delta and the stored value are each
    /// parsed as int64 falling back to float64; mixed types promote to
    /// float.
    pub fn incr(&mut self, key: &str, delta: &str) -> Result<Value> {
        self.apply_numeric(key, delta, false)
    }

    /// Decrement a numeric value. A result below zero is refused.
    pub fn decr(&mut self, key: &str, delta: &str) -> Result<Value> {
        self.apply_numeric(key, delta, true)
    }

    fn apply_numeric(&mut self, key: &str, delta: &str, subtract: bool) -> Result<Value> {
        let delta = Number::parse(delta)?;
        let (value, _) = self.get(key).ok_or(Error::KeyNotFound)?;
        let current = value.as_number()?;
        let next = if subtract {
            let next = current.sub(delta);
            if next.is_negative() {
                return Err(Error::NegativeValue);
            }
            next
        } else {
            current.add(delta)
        };
        let next: Value = next.into();
        self.put(key, next.clone());
        Ok(next)
    }

    /// Collect entries whose keys match the compiled pattern, in bucket
    /// order, applying offset then limit.
    pub fn get_with_regex(
        &self,
        pattern: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let re = Regex::new(pattern)?;
        let mut skipped = 0usize;
        let mut results = Vec::new();
        for entry in self.buckets.iter().flatten() {
            if !re.is_match(&entry.key) {
                continue;
            }
            if let Some(offset) = offset {
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
            }
            results.push(entry.clone());
            if limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
        }
        Ok(results)
    }

    /// Detailed statistics over the current table state.
    pub fn stats(&self) -> TableStats {
        let mut total_psl = 0u64;
        let mut max_psl = 0u32;
        let mut empty = 0usize;
        for bucket in &self.buckets {
            match bucket {
                None => empty += 1,
                Some(entry) => {
                    total_psl += entry.psl as u64;
                    max_psl = max_psl.max(entry.psl);
                }
            }
        }
        let avg_psl = if self.used == 0 {
            0.0
        } else {
            total_psl as f64 / self.used as f64
        };
        TableStats {
            size: self.capacity,
            used: self.used,
            load_factor: self.used as f64 / self.capacity as f64,
            grow_threshold: self.grow_threshold,
            shrink_threshold: self.shrink_threshold,
            avg_probe_length: avg_psl,
            max_probe_length: max_psl,
            empty_buckets: empty,
            empty_bucket_ratio: empty as f64 / self.capacity as f64,
            needs_grow: self.should_grow(),
            needs_shrink: self.should_shrink(),
        }
    }
}

/// Snapshot of table health, rendered on the wire as `key=value` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStats {
    pub size: usize,
    pub used: usize,
    pub load_factor: f64,
    pub grow_threshold: f64,
    pub shrink_threshold: f64,
    pub avg_probe_length: f64,
    pub max_probe_length: u32,
    pub empty_buckets: usize,
    pub empty_bucket_ratio: f64,
    pub needs_grow: bool,
    pub needs_shrink: bool,
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} used={} load_factor={:.4} grow_threshold={:.4} \
             shrink_threshold={:.4} avg_probe_length={:.4} max_probe_length={} \
             empty_buckets={} empty_bucket_ratio={:.4} needs_grow={} needs_shrink={}",
            self.size,
            self.used,
            self.load_factor,
            self.grow_threshold,
            self.shrink_threshold,
            self.avg_probe_length,
            self.max_probe_length,
            self.empty_buckets,
            self.empty_bucket_ratio,
            self.needs_grow,
            self.needs_shrink,
        )
    }
}

/// MurmurHash3 32-bit over the key bytes.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in chunks.by_ref() {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k |= (byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(table: &HashTable) {
        assert!(table.capacity.is_power_of_two());
        assert!(table.capacity >= INITIAL_CAPACITY);
        assert!(table.used <= table.capacity);
        let mask = table.capacity - 1;
        let mut live = 0;
        for (index, bucket) in table.buckets.iter().enumerate() {
            if let Some(entry) = bucket {
                live += 1;
                let home = table.slot_of(&entry.key);
                let distance = (index + table.capacity - home) & mask;
                assert_eq!(distance as u32, entry.psl, "psl mismatch for {}", entry.key);
            }
        }
        assert_eq!(live, table.used);
    }

    #[test]
    fn test_put_get_delete() {
        let mut table = HashTable::new();
        assert!(table.put("hello", Value::lift("world")));
        assert_eq!(
            table.get("hello").map(|(v, _)| v.to_string()),
            Some("world".to_string())
        );

        // Overwrite keeps used stable.
        assert!(!table.put("hello", Value::lift("there")));
        assert_eq!(table.used(), 1);
        assert_eq!(
            table.get("hello").map(|(v, _)| v.to_string()),
            Some("there".to_string())
        );

        assert!(table.delete("hello"));
        assert!(table.get("hello").is_none());
        assert!(!table.delete("hello"));
        assert_invariants(&table);
    }

    #[test]
    fn test_used_tracks_live_keys() {
        let mut table = HashTable::new();
        for i in 0..50 {
            table.put(&format!("key{}", i), Value::lift("v"));
        }
        assert_eq!(table.used(), 50);
        for i in 0..25 {
            assert!(table.delete(&format!("key{}", i)));
        }
        assert_eq!(table.used(), 25);
        for i in 25..50 {
            assert!(table.get(&format!("key{}", i)).is_some());
        }
        assert_invariants(&table);
    }

    #[test]
    fn test_grow_and_shrink_back_to_minimum() {
        let mut table = HashTable::new();
        for i in 0..500 {
            table.put(&format!("key{}", i), Value::lift(&i.to_string()));
        }
        assert!(table.capacity() > INITIAL_CAPACITY);
        assert_invariants(&table);

        for i in 0..500 {
            assert!(table.delete(&format!("key{}", i)));
        }
        assert_eq!(table.used(), 0);
        assert_eq!(table.capacity(), INITIAL_CAPACITY);
        assert_invariants(&table);
    }

    #[test]
    fn test_load_factor_bounds_after_mutation() {
        let mut table = HashTable::new();
        for i in 0..1000 {
            table.put(&format!("key{}", i), Value::lift("v"));
            let load = table.used() as f64 / table.capacity() as f64;
            assert!(load < DEFAULT_GROW_THRESHOLD);
        }
        for i in 0..1000 {
            table.delete(&format!("key{}", i));
            let load = table.used() as f64 / table.capacity() as f64;
            assert!(table.capacity() == INITIAL_CAPACITY || load > DEFAULT_SHRINK_THRESHOLD);
        }
    }

    #[test]
    fn test_incr_decr_coercion() {
        let mut table = HashTable::new();
        table.put("n", Value::lift("0"));

        assert_eq!(table.incr("n", "5").unwrap().to_string(), "5");
        assert_eq!(table.incr("n", "2.5").unwrap().to_string(), "7.5");
        assert!(matches!(table.decr("n", "8"), Err(Error::NegativeValue)));
        assert_eq!(table.decr("n", "0.5").unwrap().to_string(), "7");
    }

    #[test]
    fn test_incr_errors() {
        let mut table = HashTable::new();
        assert!(matches!(table.incr("missing", "1"), Err(Error::KeyNotFound)));
        assert!(matches!(
            table.incr("missing", "abc"),
            Err(Error::InvalidValue)
        ));

        table.put("s", Value::lift("word"));
        assert!(matches!(table.incr("s", "1"), Err(Error::InvalidValue)));
    }

    #[test]
    fn test_regex_scan_slice() {
        let mut table = HashTable::new();
        for key in ["apple", "apricot", "banana", "berry"] {
            table.put(key, Value::lift("fruit"));
        }

        let all = table.get_with_regex("^a.*", None, None).unwrap();
        assert_eq!(all.len(), 2);

        // LIMIT/OFFSET slices the deterministic full-scan order.
        let sliced = table.get_with_regex("^a.*", Some(1), Some(1)).unwrap();
        assert_eq!(sliced.len(), 1);
        assert_eq!(sliced[0].key, all[1].key);

        let none = table.get_with_regex("^z.*", None, None).unwrap();
        assert!(none.is_empty());

        assert!(table.get_with_regex("([", None, None).is_err());
    }

    #[test]
    fn test_scan_order_is_deterministic() {
        let mut table = HashTable::new();
        for i in 0..64 {
            table.put(&format!("key{}", i), Value::lift("v"));
        }
        let first: Vec<String> = table
            .get_with_regex("^key", None, None)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        let second: Vec<String> = table
            .get_with_regex("^key", None, None)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stats() {
        let mut table = HashTable::new();
        let stats = table.stats();
        assert_eq!(stats.size, INITIAL_CAPACITY);
        assert_eq!(stats.used, 0);
        assert_eq!(stats.empty_buckets, INITIAL_CAPACITY);

        table.put("a", Value::lift("1"));
        let rendered = table.stats().to_string();
        assert!(rendered.contains("size=16"));
        assert!(rendered.contains("used=1"));
        assert!(rendered.contains("needs_grow=false"));
    }

    #[test]
    fn test_murmur3_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(murmur3_32(b"hello, world", 0), 0x149b_bb7f);
    }
}
