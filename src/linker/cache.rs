//! Linkage cache - single-flight memo table with reclaimable entries
//!
//! Design: one `DashMap` slot per key, each guarded by its own mutex. The
//! first requester of a key computes under that mutex; later requesters
//! block on it and see the stored result. Failures leave the slot empty, so
//! nothing about a failed build is remembered.
//!
//! Entries start strongly held. `reclaim` demotes them to weak references:
//! an artifact nobody else holds is dropped and rebuilt on the next miss,
//! while one still in use keeps its identity.

use crate::logging;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries demoted to weak references by reclaim passes
    pub reclaimed: u64,
    /// Slots currently in the table
    pub entries: usize,
    /// Entries currently held strongly
    pub strong: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

enum Entry<V> {
    Empty,
    Strong(Arc<V>),
    Weak(Weak<V>),
}

struct Slot<V> {
    entry: Mutex<Entry<V>>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            entry: Mutex::new(Entry::Empty),
        }
    }
}

/// Concurrent memo table keyed by normalized link requests
pub struct LinkCache<K, V> {
    name: &'static str,
    slots: DashMap<K, Arc<Slot<V>>>,
    soft_limit: usize,
    log_reclaims: bool,
    strong: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    reclaimed: AtomicU64,
}

impl<K, V> LinkCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache; a `soft_limit` of 0 disables automatic reclaim
    pub fn new(name: &'static str, soft_limit: usize, log_reclaims: bool) -> Self {
        Self {
            name,
            slots: DashMap::new(),
            soft_limit,
            log_reclaims,
            strong: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key`, computing it at most once concurrently
    pub fn get_or_compute<E, F>(&self, key: K, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        // The map guard must be gone before blocking on the slot
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .value()
            .clone();

        let mut entry = slot.entry.lock();
        match &*entry {
            Entry::Strong(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value.clone());
            }
            Entry::Weak(weak) => {
                if let Some(value) = weak.upgrade() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    *entry = Entry::Strong(value.clone());
                    self.strong.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
            }
            Entry::Empty => {}
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(compute(&key)?);
        *entry = Entry::Strong(value.clone());
        // Counted before the slot unlocks, so a reclaim never demotes it uncounted
        let strong = self.strong.fetch_add(1, Ordering::Relaxed) + 1;
        drop(entry);

        if self.soft_limit > 0 && strong > self.soft_limit {
            self.reclaim();
        }
        Ok(value)
    }

    /// Demote every strong entry and purge slots whose value is gone
    ///
    /// Returns the number of demoted entries.
    pub fn reclaim(&self) -> usize {
        let mut demoted = 0;
        for item in self.slots.iter() {
            // A locked slot is being computed; leave it to its owner
            if let Some(mut entry) = item.value().entry.try_lock() {
                if let Entry::Strong(value) = &*entry {
                    *entry = Entry::Weak(Arc::downgrade(value));
                    demoted += 1;
                }
            }
        }
        self.strong.fetch_sub(demoted, Ordering::Relaxed);
        self.reclaimed.fetch_add(demoted as u64, Ordering::Relaxed);

        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot.entry.try_lock() {
            Some(entry) => match &*entry {
                Entry::Strong(_) => true,
                // Slots someone is about to lock stay, so a waiter never computes into an orphan
                Entry::Weak(weak) => weak.strong_count() > 0 || Arc::strong_count(slot) > 1,
                Entry::Empty => Arc::strong_count(slot) > 1,
            },
            None => true,
        });
        let purged = before.saturating_sub(self.slots.len());

        if self.log_reclaims {
            logging::log_cache_reclaim(self.name, demoted, purged);
        }
        demoted
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            entries: self.slots.len(),
            strong: self.strong.load(Ordering::Relaxed),
        }
    }
}
