//! Typed per-feature state slots.
//!
//! Each processor declares its own [`DataKey`] constants, so the value type
//! is fixed at the key and no caller ever casts. Values are shared through
//! `Arc`; mutable state goes behind atomics or a lock inside the value.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

type Slot = Arc<dyn Any + Send + Sync>;

/// Typed key naming one slot in a [`TypedMap`].
pub struct DataKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DataKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for DataKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DataKey<T> {}

impl<T> fmt::Debug for DataKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DataKey").field(&self.name).finish()
    }
}

/// Concurrent map of typed slots.
///
/// Writes are published through the map's shard locks, so a value stored by
/// one task is visible to every other task reading the same map afterwards.
#[derive(Default)]
pub struct TypedMap {
    slots: DashMap<&'static str, Slot>,
}

impl TypedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &DataKey<T>) -> Option<Arc<T>> {
        let slot = self.slots.get(key.name)?.value().clone();
        slot.downcast::<T>().ok()
    }

    /// Store a value, returning the previous one of the same type.
    pub fn put<T: Any + Send + Sync>(&self, key: &DataKey<T>, value: T) -> Option<Arc<T>> {
        let slot: Slot = Arc::new(value);
        self.slots
            .insert(key.name, slot)
            .and_then(|old| old.downcast::<T>().ok())
    }

    /// Return the stored value, creating it atomically when absent.
    pub fn get_or_insert_with<T, F>(&self, key: &DataKey<T>, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        match self.slots.entry(key.name) {
            Entry::Occupied(mut entry) => {
                if let Ok(existing) = entry.get().clone().downcast::<T>() {
                    return existing;
                }
                let value = Arc::new(init());
                let slot: Slot = value.clone();
                entry.insert(slot);
                value
            }
            Entry::Vacant(entry) => {
                let value = Arc::new(init());
                let slot: Slot = value.clone();
                entry.insert(slot);
                value
            }
        }
    }

    pub fn remove<T: Any + Send + Sync>(&self, key: &DataKey<T>) -> Option<Arc<T>> {
        self.slots
            .remove(key.name)
            .and_then(|(_, old)| old.downcast::<T>().ok())
    }

    pub fn contains<T>(&self, key: &DataKey<T>) -> bool {
        self.slots.contains_key(key.name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl fmt::Debug for TypedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&'static str> = self.slots.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        f.debug_struct("TypedMap").field("slots", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const COUNTER: DataKey<AtomicU32> = DataKey::new("test-counter");
    const LABEL: DataKey<String> = DataKey::new("test-label");

    #[test]
    fn test_put_and_get() {
        let map = TypedMap::new();
        assert!(map.get(&LABEL).is_none());
        assert!(map.put(&LABEL, "first".to_string()).is_none());
        let previous = map.put(&LABEL, "second".to_string());
        assert_eq!(previous.as_deref().map(String::as_str), Some("first"));
        assert_eq!(map.get(&LABEL).as_deref().map(String::as_str), Some("second"));
    }

    #[test]
    fn test_get_or_insert_with_shares_value() {
        let map = TypedMap::new();
        let first = map.get_or_insert_with(&COUNTER, || AtomicU32::new(0));
        first.fetch_add(1, Ordering::SeqCst);
        let second = map.get_or_insert_with(&COUNTER, || AtomicU32::new(100));
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_type_mismatch_reads_none() {
        let map = TypedMap::new();
        let wrong: DataKey<u64> = DataKey::new("test-label");
        map.put(&LABEL, "value".to_string());
        assert!(map.get(&wrong).is_none());
        assert!(map.contains(&wrong));
    }

    #[test]
    fn test_remove_and_clear() {
        let map = TypedMap::new();
        map.put(&LABEL, "x".to_string());
        map.put(&COUNTER, AtomicU32::new(3));
        assert_eq!(map.len(), 2);
        assert!(map.remove(&LABEL).is_some());
        assert!(!map.contains(&LABEL));
        map.clear();
        assert!(map.is_empty());
    }
}
