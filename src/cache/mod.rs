//! Cache plug-in boundary for the read-cache layer
//!
//! The read-cache layer delegates every eviction decision to a cache
//! plug-in behind the [`BlockCache`] trait; the layer itself only inserts,
//! looks up, and removes block entries. The in-process implementation is an
//! LRU bounded by a block count; deployments can substitute their own
//! policy by handing the layer a different implementation.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Block store keyed by `"<inode>/<block_index>"` strings.
///
/// Implementations are internally synchronized; the read-cache layer calls
/// them from concurrently dispatched operations without further locking.
pub trait BlockCache: Send + Sync {
    /// Insert or replace the entry for `key`.
    fn insert(&self, key: &str, block: &[u8]);

    /// Copy of the cached entry, if present. Counts as a use for policies
    /// that track recency.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Remove the entry for `key`. Returns whether it was present.
    fn remove(&self, key: &str) -> bool;

    /// Presence check that does not count as a use.
    fn contains(&self, key: &str) -> bool;

    /// Number of cached entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// LRU cache bounded by a maximum number of blocks.
pub struct LruBlockCache {
    entries: Mutex<LruCache<String, Vec<u8>>>,
}

impl LruBlockCache {
    /// Create a cache holding at most `num_blocks` entries. A zero capacity
    /// is clamped to one entry.
    pub fn new(num_blocks: usize) -> Self {
        let cap = NonZeroUsize::new(num_blocks.max(1)).unwrap();
        LruBlockCache {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl BlockCache for LruBlockCache {
    fn insert(&self, key: &str, block: &[u8]) {
        self.entries.lock().put(key.to_owned(), block.to_vec());
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    fn contains(&self, key: &str) -> bool {
        // peek, not get: a coherence probe must not refresh recency
        self.entries.lock().peek(key).is_some()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
