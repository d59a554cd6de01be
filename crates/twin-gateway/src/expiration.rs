//! Disconnects devices whose access token expired.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use twin_proto::DeviceId;
use uuid::Uuid;

use crate::session::Session;

/// Expiring sessions by device.
pub type SessionExpirations = ExpirationCache<Session>;

struct Entry<T> {
    owner: Uuid,
    expires_at: DateTime<Utc>,
    target: Weak<T>,
}

/// Device-keyed expiry times of weakly held entries.
pub struct ExpirationCache<T> {
    entries: Mutex<HashMap<DeviceId, Entry<T>>>,
}

impl<T> ExpirationCache<T> {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Set or clear the expiry of `device_id`; `None` never expires.
    pub fn set(&self, device_id: DeviceId, owner: Uuid, expires_at: Option<DateTime<Utc>>, target: &Arc<T>) {
        let mut entries = self.entries.lock();
        match expires_at {
            Some(expires_at) => {
                entries.insert(
                    device_id,
                    Entry {
                        owner,
                        expires_at,
                        target: Arc::downgrade(target),
                    },
                );
            }
            None => {
                entries.remove(&device_id);
            }
        }
    }

    /// Drop the entry of `device_id` if `owner` set it.
    pub fn remove(&self, device_id: &DeviceId, owner: Uuid) {
        let mut entries = self.entries.lock();
        if entries.get(device_id).is_some_and(|e| e.owner == owner) {
            entries.remove(device_id);
        }
    }

    /// Expiry of `device_id`.
    #[must_use]
    pub fn expires_at(&self, device_id: &DeviceId) -> Option<DateTime<Utc>> {
        self.entries.lock().get(device_id).map(|e| e.expires_at)
    }

    /// Remove entries expired at `now`, returning the live targets.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<(DeviceId, Arc<T>)> {
        let mut expired = Vec::new();
        self.entries.lock().retain(|device_id, entry| {
            if entry.expires_at > now {
                return true;
            }
            if let Some(target) = entry.target.upgrade() {
                expired.push((device_id.clone(), target));
            }
            false
        });
        expired
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for ExpirationCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sweep_returns_expired_only() {
        let cache = ExpirationCache::new();
        let now = Utc::now();
        let a = Arc::new("a");
        let b = Arc::new("b");
        cache.set(DeviceId::new("a"), Uuid::new_v4(), Some(now - Duration::seconds(1)), &a);
        cache.set(DeviceId::new("b"), Uuid::new_v4(), Some(now + Duration::hours(1)), &b);

        let expired = cache.sweep(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(*expired[0].1, "a");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_none_clears_entry() {
        let cache = ExpirationCache::new();
        let a = Arc::new(1);
        cache.set(DeviceId::new("a"), Uuid::new_v4(), Some(Utc::now()), &a);
        cache.set(DeviceId::new("a"), Uuid::new_v4(), None, &a);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_requires_owner() {
        let cache = ExpirationCache::new();
        let owner = Uuid::new_v4();
        let a = Arc::new(1);
        cache.set(DeviceId::new("a"), owner, Some(Utc::now()), &a);
        cache.remove(&DeviceId::new("a"), Uuid::new_v4());
        assert_eq!(cache.len(), 1);
        cache.remove(&DeviceId::new("a"), owner);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dropped_target_is_discarded() {
        let cache = ExpirationCache::new();
        {
            let a = Arc::new(1);
            cache.set(DeviceId::new("a"), Uuid::new_v4(), Some(Utc::now() - Duration::seconds(1)), &a);
        }
        assert!(cache.sweep(Utc::now()).is_empty());
        assert!(cache.is_empty());
    }
}
