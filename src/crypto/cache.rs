//! Time-bounded cache of unwrapped tenant keys.

use std::time::Duration;

use moka::sync::Cache;

use super::cipher::SecretKey;

/// Tenant id → raw key with a fixed time-to-live.
///
/// Expired entries are never returned and are evicted by the cache's own housekeeping.
pub struct KeyCache {
    entries: Option<Cache<String, SecretKey>>,
}

impl KeyCache {
    /// Cache whose entries live for `ttl`. A zero TTL disables caching.
    pub fn new(ttl: Duration) -> Self {
        let entries = (!ttl.is_zero()).then(|| Cache::builder().time_to_live(ttl).build());
        Self { entries }
    }

    /// Cached key for `tenant_id`, if present and not expired.
    pub fn get(&self, tenant_id: &str) -> Option<SecretKey> {
        self.entries.as_ref()?.get(tenant_id)
    }

    /// Cache `key` for `tenant_id`, replacing any previous entry.
    pub fn insert(&self, tenant_id: &str, key: SecretKey) {
        if let Some(entries) = &self.entries {
            entries.insert(tenant_id.to_string(), key);
        }
    }

    /// Drop the entry for one tenant.
    pub fn invalidate(&self, tenant_id: &str) {
        if let Some(entries) = &self.entries {
            entries.invalidate(tenant_id);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.invalidate_all();
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let Some(entries) = &self.entries else {
            return 0;
        };
        // entry_count lags behind writes until pending maintenance runs
        entries.run_pending_tasks();
        usize::try_from(entries.entry_count()).unwrap_or(usize::MAX)
    }

    /// Whether no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_keys_are_returned_until_cleared() {
        let cache = KeyCache::new(Duration::from_secs(60));
        let key = SecretKey::generate();
        cache.insert("acme", key.clone());

        assert_eq!(cache.get("acme"), Some(key));
        assert!(cache.get("globex").is_none());

        cache.clear();
        assert!(cache.get("acme").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_are_ignored() {
        let cache = KeyCache::new(Duration::from_millis(5));
        cache.insert("acme", SecretKey::generate());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("acme").is_none());
    }

    #[test]
    fn expired_entries_are_evicted() {
        let cache = KeyCache::new(Duration::from_millis(5));
        for tenant in ["acme", "globex", "initech"] {
            cache.insert(tenant, SecretKey::generate());
        }
        assert_eq!(cache.len(), 3);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn invalidate_is_per_tenant() {
        let cache = KeyCache::new(Duration::from_secs(60));
        cache.insert("acme", SecretKey::generate());
        cache.insert("globex", SecretKey::generate());
        cache.invalidate("acme");
        assert!(cache.get("acme").is_none());
        assert!(cache.get("globex").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = KeyCache::new(Duration::ZERO);
        cache.insert("acme", SecretKey::generate());
        assert!(cache.get("acme").is_none());
        assert!(cache.is_empty());
    }
}
