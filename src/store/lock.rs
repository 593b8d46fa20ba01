//! Content-hash-level locking.
//!
//! A reference-counted pool of mutexes keyed by `(allocation_id, content
//! hash)`. Concurrent writers of identical content serialize on one entry;
//! operations on different hashes never contend. Releasing the last
//! reference removes the entry, so the pool never grows with the number of
//! hashes ever seen. Entries are never persisted.

use crate::types::{hash_hex, Hash};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

struct PoolEntry {
    mutex: Arc<Mutex<()>>,
    refs: usize,
}

type PoolMap = Mutex<HashMap<String, PoolEntry>>;

/// Pool of per-content locks.
#[derive(Default)]
pub struct ContentLockPool {
    entries: Arc<PoolMap>,
}

impl ContentLockPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(allocation_id: &str, content_hash: &Hash) -> String {
        format!("{}:{}", allocation_id, hash_hex(content_hash))
    }

    /// Acquire the lock for `(allocation_id, content_hash)`, blocking while
    /// another holder exists.
    pub fn acquire(&self, allocation_id: &str, content_hash: &Hash) -> ContentGuard {
        let key = Self::key(allocation_id, content_hash);
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| PoolEntry {
                mutex: Arc::new(Mutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.mutex)
        };
        // Block outside the pool map lock so unrelated keys stay available.
        let guard = mutex.lock_arc();
        ContentGuard {
            key,
            entries: Arc::clone(&self.entries),
            guard: Some(guard),
        }
    }

    /// Acquire only if no other holder or waiter exists for the key.
    ///
    /// `None` is the `not_new_lock` signal: a concurrent operation on this
    /// exact content is already in flight and the caller should treat the
    /// physical side effect as handled.
    pub fn try_acquire(&self, allocation_id: &str, content_hash: &Hash) -> Option<ContentGuard> {
        let key = Self::key(allocation_id, content_hash);
        let mutex = {
            let mut entries = self.entries.lock();
            if entries.contains_key(&key) {
                return None;
            }
            let entry = PoolEntry {
                mutex: Arc::new(Mutex::new(())),
                refs: 1,
            };
            let mutex = Arc::clone(&entry.mutex);
            entries.insert(key.clone(), entry);
            mutex
        };
        // Freshly inserted entry, so this cannot block.
        let guard = mutex.lock_arc();
        Some(ContentGuard {
            key,
            entries: Arc::clone(&self.entries),
            guard: Some(guard),
        })
    }

    /// Live entries, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock for one `(allocation_id, content_hash)` key. Dropping releases
/// the mutex and removes the pool entry once the last reference is gone.
pub struct ContentGuard {
    key: String,
    entries: Arc<PoolMap>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for ContentGuard {
    fn drop(&mut self) {
        // Release the mutex before touching the refcount so a blocked
        // acquirer can proceed with the entry still present.
        self.guard.take();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&self.key);
            }
        }
    }
}
