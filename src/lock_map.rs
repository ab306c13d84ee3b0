//! Per-instance operation serialization.
//!
//! Every operation touching one instance runs under that instance's mutex,
//! while operations on distinct instances proceed in parallel. Mutexes are
//! created lazily on first lock and collected when the last guard drops, so
//! removed instances leave nothing behind.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct LockMap<K: Hash + Eq> {
    inner: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Hash + Eq> Default for LockMap<K> {
    fn default() -> Self {
        Self {
            inner: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

/// Guard for one key. Dropping it releases the lock and, when no other
/// holder references the key's mutex, removes the map entry.
pub struct LockMapGuard<'m, K: Hash + Eq> {
    map: &'m LockMap<K>,
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K: Hash + Eq> Drop for LockMapGuard<'_, K> {
    fn drop(&mut self) {
        let mut map = self.map.inner.lock().expect("lock map guard");
        let collectable = map
            .get(&self.key)
            .map(|mutex| Arc::strong_count(mutex) <= 2)
            .unwrap_or(false);
        if collectable {
            map.remove(&self.key);
        }
    }
}

impl<K: Hash + Eq + Clone> LockMap<K> {
    fn mutex_by_key(&self, key: K) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("lock map guard");
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> LockMapGuard<'_, K> {
        let guard = self.mutex_by_key(key.clone()).lock_owned().await;
        LockMapGuard {
            map: self,
            key,
            _guard: guard,
        }
    }

    /// Number of live entries, for tests and introspection.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock map guard").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
