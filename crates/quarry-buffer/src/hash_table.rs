//! Extendible hash table used as the buffer pool's page table.

use log::trace;
use parking_lot::Mutex;

use quarry_common::PageId;

/// Default capacity of a hash bucket.
pub const DEFAULT_BUCKET_CAPACITY: usize = 50;

/// Keys usable in the extendible hash table.
///
/// The directory is addressed by the low bits of `hash_key`, so the hash must
/// be stable for the lifetime of the table. Integer keys hash to themselves.
pub trait HashKey: Copy + Eq {
    /// Returns the hash of this key.
    fn hash_key(&self) -> u64;
}

impl HashKey for i32 {
    fn hash_key(&self) -> u64 {
        *self as u32 as u64
    }
}

impl HashKey for u32 {
    fn hash_key(&self) -> u64 {
        *self as u64
    }
}

impl HashKey for i64 {
    fn hash_key(&self) -> u64 {
        *self as u64
    }
}

impl HashKey for u64 {
    fn hash_key(&self) -> u64 {
        *self
    }
}

impl HashKey for usize {
    fn hash_key(&self) -> u64 {
        *self as u64
    }
}

impl HashKey for PageId {
    fn hash_key(&self) -> u64 {
        self.raw() as u32 as u64
    }
}

struct Bucket<K, V> {
    /// Number of low hash bits identifying this bucket within the directory.
    local_depth: u32,
    items: Vec<(K, V)>,
}

struct HashInner<K, V> {
    global_depth: u32,
    bucket_capacity: usize,
    /// Directory of bucket arena indices, length `2^global_depth`. Entries
    /// that agree in the low `local_depth` bits share a bucket.
    directory: Vec<usize>,
    /// Bucket arena. Buckets are created at construction and by splits and
    /// are never destroyed.
    buckets: Vec<Bucket<K, V>>,
}

/// Generic key-value map with dynamic bucket splitting (no shrink).
///
/// A bucket holding more than `bucket_capacity` entries is split, doubling
/// the directory when its local depth has caught up with the global depth.
/// Keys are only re-bucketed on the mutation paths that resize; reads never
/// move entries.
pub struct ExtendibleHashTable<K, V> {
    inner: Mutex<HashInner<K, V>>,
}

impl<K: HashKey, V: Clone> ExtendibleHashTable<K, V> {
    /// Creates a table with a single depth-0 bucket of the given capacity.
    pub fn new(bucket_capacity: usize) -> Self {
        assert!(bucket_capacity > 0, "bucket capacity must be positive");
        Self {
            inner: Mutex::new(HashInner {
                global_depth: 0,
                bucket_capacity,
                directory: vec![0],
                buckets: vec![Bucket {
                    local_depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    /// Looks up the value associated with `key`.
    pub fn find(&self, key: K) -> Option<V> {
        let inner = self.inner.lock();
        let bucket = &inner.buckets[inner.bucket_of(key)];
        bucket
            .items
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }

    /// Inserts `key -> value`, overwriting the value of an existing key.
    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let bucket_idx = inner.bucket_of(key);
        let bucket = &mut inner.buckets[bucket_idx];

        if let Some(slot) = bucket.items.iter().position(|(k, _)| *k == key) {
            bucket.items[slot].1 = value;
            return;
        }

        bucket.items.push((key, value));
        if bucket.items.len() > inner.bucket_capacity {
            inner.split_bucket(bucket_idx);
        }
    }

    /// Removes `key`. Returns whether it was present.
    pub fn remove(&self, key: K) -> bool {
        let mut inner = self.inner.lock();
        let bucket_idx = inner.bucket_of(key);
        let bucket = &mut inner.buckets[bucket_idx];
        match bucket.items.iter().position(|(k, _)| *k == key) {
            Some(slot) => {
                bucket.items.swap_remove(slot);
                true
            }
            None => false,
        }
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let mut seen = vec![false; inner.buckets.len()];
        let mut count = 0;
        for &b in &inner.directory {
            if !seen[b] {
                seen[b] = true;
                count += inner.buckets[b].items.len();
            }
        }
        count
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the global depth of the directory.
    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    /// Returns the number of distinct buckets reachable from the directory.
    pub fn num_buckets(&self) -> usize {
        let inner = self.inner.lock();
        let mut seen = vec![false; inner.buckets.len()];
        let mut count = 0;
        for &b in &inner.directory {
            if !seen[b] {
                seen[b] = true;
                count += 1;
            }
        }
        count
    }
}

impl<K: HashKey, V> HashInner<K, V> {
    #[inline]
    fn dir_index(&self, key: K) -> usize {
        (key.hash_key() & ((1u64 << self.global_depth) - 1)) as usize
    }

    #[inline]
    fn bucket_of(&self, key: K) -> usize {
        self.directory[self.dir_index(key)]
    }

    /// Splits the bucket at arena index `target`, doubling the directory as
    /// needed, until no reachable bucket overflows.
    fn split_bucket(&mut self, mut target: usize) {
        loop {
            if self.buckets[target].local_depth == self.global_depth {
                // Double the directory: the upper half mirrors the lower.
                let old_len = self.directory.len();
                for j in 0..old_len {
                    let mirrored = self.directory[j];
                    self.directory.push(mirrored);
                }
                self.global_depth += 1;
                trace!("hash directory doubled to global depth {}", self.global_depth);
                continue;
            }

            // Redistribute on the bit that newly distinguishes the halves.
            let bit = self.buckets[target].local_depth;
            let new_depth = bit + 1;

            let items = std::mem::take(&mut self.buckets[target].items);
            self.buckets[target].local_depth = new_depth;
            let sibling = self.buckets.len();
            self.buckets.push(Bucket {
                local_depth: new_depth,
                items: Vec::new(),
            });

            for (k, v) in items {
                if (k.hash_key() >> bit) & 1 == 1 {
                    self.buckets[sibling].items.push((k, v));
                } else {
                    self.buckets[target].items.push((k, v));
                }
            }

            for slot in 0..self.directory.len() {
                if self.directory[slot] == target && (slot >> bit) & 1 == 1 {
                    self.directory[slot] = sibling;
                }
            }

            // Re-split whichever half still overflows, largest first.
            let target_len = self.buckets[target].items.len();
            let sibling_len = self.buckets[sibling].items.len();
            let target_over = target_len > self.bucket_capacity;
            let sibling_over = sibling_len > self.bucket_capacity;

            target = match (target_over, sibling_over) {
                (false, false) => return,
                (true, false) => target,
                (false, true) => sibling,
                (true, true) => {
                    if target_len >= sibling_len {
                        target
                    } else {
                        sibling
                    }
                }
            };
        }
    }
}
