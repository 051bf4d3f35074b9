use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kmirror_core::{ObjectKey, ObjectStore, Resource, Result};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Default)]
struct Inner {
    items: FxHashMap<ObjectKey, Resource>,
    resource_version: String,
}

/// Thread-safe key→resource map. Last write wins per key.
#[derive(Default)]
pub struct Store {
    inner: RwLock<Inner>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer cannot leave the map half-updated: every mutation is a
    // single insert/remove/swap, so a poisoned guard is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, obj: Resource) {
        self.write().items.insert(obj.key.clone(), obj);
    }

    pub fn update(&self, obj: Resource) {
        self.add(obj)
    }

    /// Remove and return the stored object, if any.
    pub fn delete(&self, key: &ObjectKey) -> Option<Resource> {
        self.write().items.remove(key)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Resource> {
        self.read().items.get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.read().items.contains_key(key)
    }

    pub fn list(&self) -> Vec<Resource> {
        self.read().items.values().cloned().collect()
    }

    /// Keys in sorted order, for stable printing.
    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.read().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Swap the whole content in one step. The new map is built before the
    /// write lock is taken.
    pub fn replace(&self, items: impl IntoIterator<Item = Resource>, resource_version: &str) {
        let next: FxHashMap<_, _> = items.into_iter().map(|o| (o.key.clone(), o)).collect();
        let count = next.len();
        {
            let mut inner = self.write();
            inner.items = next;
            inner.resource_version = resource_version.to_string();
        }
        debug!(count, rv = %resource_version, "store replaced");
    }

    /// resourceVersion passed to the last `replace`.
    pub fn last_sync_resource_version(&self) -> String {
        self.read().resource_version.clone()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for Store {
    fn add(&self, obj: Resource) -> Result<()> {
        Store::add(self, obj);
        Ok(())
    }

    fn update(&self, obj: Resource) -> Result<()> {
        Store::update(self, obj);
        Ok(())
    }

    fn delete(&self, obj: Resource) -> Result<()> {
        Store::delete(self, &obj.key);
        Ok(())
    }

    fn get(&self, key: &ObjectKey) -> Option<Resource> {
        Store::get(self, key)
    }

    fn list_keys(&self) -> Vec<ObjectKey> {
        Store::list_keys(self)
    }

    fn replace(&self, items: Vec<Resource>, resource_version: &str) -> Result<()> {
        Store::replace(self, items, resource_version);
        Ok(())
    }
}
