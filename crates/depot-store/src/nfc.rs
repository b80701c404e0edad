use depot_model::StoreKey;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Remembers `(store, path)` lookups that recently missed so remote stores are
/// not asked again for content they do not have.
pub trait NotFoundCache: Send + Sync {
    fn record_missing(&self, key: &StoreKey, path: &str);
    fn is_missing(&self, key: &StoreKey, path: &str) -> bool;
    fn clear_missing(&self, key: &StoreKey, path: &str);
    fn clear_store(&self, key: &StoreKey);
}

#[derive(Debug, Default)]
pub struct MemoryNotFoundCache {
    missing: Mutex<HashMap<StoreKey, HashSet<String>>>,
}

impl MemoryNotFoundCache {
    pub fn new() -> Self {
        Self::default()
    }
}

// A poisoned cache only loses hints, so lock failures are treated as misses.
impl NotFoundCache for MemoryNotFoundCache {
    fn record_missing(&self, key: &StoreKey, path: &str) {
        if let Ok(mut map) = self.missing.lock() {
            map.entry(key.clone()).or_default().insert(path.to_owned());
        }
    }

    fn is_missing(&self, key: &StoreKey, path: &str) -> bool {
        self.missing
            .lock()
            .map(|map| map.get(key).is_some_and(|paths| paths.contains(path)))
            .unwrap_or(false)
    }

    fn clear_missing(&self, key: &StoreKey, path: &str) {
        if let Ok(mut map) = self.missing.lock() {
            if let Some(paths) = map.get_mut(key) {
                paths.remove(path);
                if paths.is_empty() {
                    map.remove(key);
                }
            }
        }
    }

    fn clear_store(&self, key: &StoreKey) {
        if let Ok(mut map) = self.missing.lock() {
            map.remove(key);
        }
    }
}
