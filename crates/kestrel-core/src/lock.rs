//! Keyed mutex map.
//!
//! Each key (a host identity) owns its own `tokio::sync::Mutex`, so
//! mutations against one host serialize while other hosts proceed. Guards
//! are owned, so the critical section ends when the guard is dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// A map from key to an independently lockable value.
pub struct KeyedMutex<K, V> {
    slots: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Lock the value for `key`, creating it with `init` if absent.
    pub async fn lock_or_insert_with(
        &self,
        key: &K,
        init: impl FnOnce() -> V,
    ) -> OwnedMutexGuard<V> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(key).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut slots = self.slots.write().await;
                slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(init())))
                    .clone()
            }
        };
        slot.lock_owned().await
    }

    /// Lock the value for `key` if it exists.
    pub async fn lock(&self, key: &K) -> Option<OwnedMutexGuard<V>> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(key).cloned()
        }?;
        Some(slot.lock_owned().await)
    }

    /// Drop every key not in `keep`.
    pub async fn retain(&self, keep: impl Fn(&K) -> bool) {
        self.slots.write().await.retain(|k, _| keep(k));
    }
}

impl<K, V> Default for KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
