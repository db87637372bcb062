//! Bounded FIFO map from message id to payload.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::config::CacheConfig;

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    evictions: u64,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CorrelationCacheStats {
    pub len: usize,
    pub capacity: usize,
    pub evictions: u64,
}

/// Bounded map with first-in-first-out eviction.
///
/// Reads never change eviction order, and inserting an id that is already
/// present leaves the existing entry (and its position) untouched.
#[derive(Debug)]
pub struct CorrelationCache<V> {
    inner: Mutex<CacheInner<V>>,
    capacity: usize,
}

impl<V: Clone> CorrelationCache<V> {
    /// Create a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                evictions: 0,
            }),
            capacity,
        }
    }

    /// Insert `value` under `id`.
    ///
    /// Returns `false` when the id was already cached. At capacity the single
    /// oldest entry is evicted before inserting.
    pub fn put(&self, id: impl Into<String>, value: V) -> bool {
        let id = id.into();
        let mut inner = self.lock();

        if inner.entries.contains_key(&id) {
            return false;
        }

        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                debug!("Evicted message {} from correlation cache", oldest);
            }
        }

        inner.order.push_back(id.clone());
        inner.entries.insert(id, value);
        true
    }

    /// Look up an entry without affecting eviction order.
    pub fn get(&self, id: &str) -> Option<V> {
        self.lock().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CorrelationCacheStats {
        let inner = self.lock();
        CorrelationCacheStats {
            len: inner.order.len(),
            capacity: self.capacity,
            evictions: inner.evictions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Clone> Default for CorrelationCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::MESSAGE_CACHE_CAPACITY)
    }
}
