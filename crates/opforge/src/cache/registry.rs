use super::ProgramKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
}

/// Generated programs by key. Lookups and inserts go through one lock, held while a
/// missing entry is built, so a key is generated at most once while caching is on.
pub struct ProgramCache<T> {
    inner: Mutex<HashMap<ProgramKey, T>>,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone> ProgramCache<T> {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &ProgramKey) -> Option<T> {
        self.lock().get(key).cloned()
    }

    /// Insert unless `key` is already present; returns the value now stored.
    pub fn insert(&self, key: ProgramKey, value: T) -> T {
        if !self.enabled {
            return value;
        }
        self.lock().entry(key).or_insert(value).clone()
    }

    pub fn get_or_try_insert_with<E>(
        &self,
        key: ProgramKey,
        build: impl FnOnce(&ProgramKey) -> Result<T, E>,
    ) -> Result<T, E> {
        if !self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return build(&key);
        }
        let mut guard = self.lock();
        if let Some(found) = guard.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = build(&key)?;
        guard.insert(key, value.clone());
        Ok(value)
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// A build that panicked leaves the map without its entry, never half-written,
    /// so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<ProgramKey, T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
