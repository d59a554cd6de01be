//! Device-ID keyed index of live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use twin_proto::DeviceId;
use uuid::Uuid;

use crate::session::Session;

/// Sessions by signed-in device.
pub type SessionIndex = DeviceIndex<Session>;

/// Maps a device ID to the one entry currently serving it.
///
/// Entries carry the ID of their owner so a late unregister from a replaced
/// owner cannot remove its successor.
pub struct DeviceIndex<T> {
    entries: Mutex<HashMap<DeviceId, (Uuid, Arc<T>)>>,
}

impl<T> DeviceIndex<T> {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register `value` for `device_id`, returning the entry it replaced.
    pub fn register(&self, device_id: DeviceId, owner: Uuid, value: Arc<T>) -> Option<Arc<T>> {
        self.entries
            .lock()
            .insert(device_id, (owner, value))
            .map(|(_, previous)| previous)
    }

    /// Remove the entry of `device_id` if `owner` registered it.
    pub fn unregister(&self, device_id: &DeviceId, owner: Uuid) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(device_id) {
            Some((registered, _)) if *registered == owner => {
                entries.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Entry serving `device_id`.
    #[must_use]
    pub fn find(&self, device_id: &DeviceId) -> Option<Arc<T>> {
        self.entries.lock().get(device_id).map(|(_, v)| Arc::clone(v))
    }

    /// True when `device_id` has an entry.
    #[must_use]
    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.entries.lock().contains_key(device_id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.entries.lock().drain().map(|(_, (_, v))| v).collect()
    }
}

impl<T> Default for DeviceIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_find() {
        let index = DeviceIndex::new();
        let owner = Uuid::new_v4();
        assert!(index.register(DeviceId::new("a"), owner, Arc::new(1)).is_none());
        assert_eq!(index.find(&DeviceId::new("a")).as_deref(), Some(&1));
        assert!(index.find(&DeviceId::new("b")).is_none());
    }

    #[test]
    fn test_register_replaces() {
        let index = DeviceIndex::new();
        index.register(DeviceId::new("a"), Uuid::new_v4(), Arc::new(1));
        let previous = index.register(DeviceId::new("a"), Uuid::new_v4(), Arc::new(2));
        assert_eq!(previous.as_deref(), Some(&1));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_unregister_requires_owner() {
        let index = DeviceIndex::new();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        index.register(DeviceId::new("a"), old, Arc::new(1));
        index.register(DeviceId::new("a"), new, Arc::new(2));

        assert!(!index.unregister(&DeviceId::new("a"), old));
        assert!(index.contains(&DeviceId::new("a")));
        assert!(index.unregister(&DeviceId::new("a"), new));
        assert!(index.is_empty());
    }

    #[test]
    fn test_drain() {
        let index = DeviceIndex::new();
        index.register(DeviceId::new("a"), Uuid::new_v4(), Arc::new(1));
        index.register(DeviceId::new("b"), Uuid::new_v4(), Arc::new(2));
        assert_eq!(index.drain().len(), 2);
        assert!(index.is_empty());
    }
}
