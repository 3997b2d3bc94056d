use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Bounded recency window of inbound event ids.
///
/// Insertion order decides eviction: once the window is full the oldest id is
/// forgotten, so a replay older than `capacity` events is accepted again.
/// Lookups use `contains`, which leaves the recency order untouched.
#[derive(Debug)]
pub struct MessageDedupCache {
    capacity: NonZeroUsize,
    window: Mutex<LruCache<String, ()>>,
}

impl MessageDedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            window: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.lock_window().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `id` was already recorded; otherwise records it and
    /// returns `false`. Check and insert happen under one lock.
    pub fn seen(&self, id: &str) -> bool {
        let mut window = self.lock_window();
        if window.contains(id) {
            return true;
        }

        if let Some((evicted, ())) = window.push(id.to_string(), ()) {
            tracing::trace!(evicted_id = %evicted, "dedup window evicted oldest id");
        }
        false
    }

    fn lock_window(&self) -> MutexGuard<'_, LruCache<String, ()>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MessageDedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
