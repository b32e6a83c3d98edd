//! Lazily-populated map of per-service objects.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// Map whose values are created on first use and shared afterwards.
///
/// Creation uses double-checked locking, so concurrent first callers for
/// the same key all receive the same instance.
#[derive(Debug)]
pub struct KeyedMap<K, V> {
    inner: RwLock<HashMap<K, Arc<V>>>,
}

impl<K: Eq + Hash, V> Default for KeyedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> KeyedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    pub fn get_or_insert_with<Q>(&self, key: &Q, make: impl FnOnce() -> V) -> Arc<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(existing) = self.get(key) {
            return existing;
        }

        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(key) {
            return existing.clone();
        }
        let value = Arc::new(make());
        map.insert(key.to_owned(), value.clone());
        value
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
