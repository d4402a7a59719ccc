use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine as _;

use cloudpaste_core::path;

const DEFAULT_MAX_ENTRIES: usize = 300;
const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_PRUNE_PERCENTAGE: u32 = 20;

#[derive(Debug, Clone)]
pub struct DirectoryCacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
    /// Share of the oldest entries evicted when the map overflows.
    pub prune_percentage: u32,
}

impl Default for DirectoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl: DEFAULT_TTL,
            prune_percentage: DEFAULT_PRUNE_PERCENTAGE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub size: usize,
}

#[derive(Debug)]
struct Entry {
    data: serde_json::Value,
    expires_at: Instant,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, Entry>,
    tick: u64,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

/// Bounded LRU+TTL cache of serialized directory listings.
///
/// Keys are `<mountId>:base64(dirPath)` where the path is forced to a
/// trailing slash, so the same directory always maps to one key no matter
/// how the caller spelled it.
#[derive(Debug)]
pub struct DirectoryCache {
    config: DirectoryCacheConfig,
    inner: Mutex<Inner>,
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new(DirectoryCacheConfig::default())
    }
}

impl DirectoryCache {
    pub fn new(config: DirectoryCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn key(mount_id: &str, dir_path: &str) -> String {
        let normalized = path::normalize_dir(dir_path).unwrap_or_else(|_| "/".to_string());
        let encoded = base64::engine::general_purpose::STANDARD.encode(normalized.as_bytes());
        format!("{mount_id}:{encoded}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, mount_id: &str, dir_path: &str) -> Option<serde_json::Value> {
        let key = Self::key(mount_id, dir_path);
        let now = Instant::now();
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let expired = matches!(inner.map.get(&key), Some(e) if e.expires_at <= now);
        if expired {
            inner.map.remove(&key);
        }

        let data = inner.map.get_mut(&key).map(|entry| {
            entry.last_used = tick;
            entry.data.clone()
        });
        match &data {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        data
    }

    pub fn set(
        &self,
        mount_id: &str,
        dir_path: &str,
        data: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        let key = Self::key(mount_id, dir_path);
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        inner.map.insert(
            key,
            Entry {
                data,
                expires_at: Instant::now() + ttl,
                last_used: tick,
            },
        );

        if inner.map.len() > self.config.max_entries {
            self.prune_locked(&mut inner);
        }
    }

    /// Evict the least-recently-used `prune_percentage` of entries.
    fn prune_locked(&self, inner: &mut Inner) {
        let victims = (inner.map.len() * self.config.prune_percentage as usize).div_ceil(100);
        if victims == 0 {
            return;
        }
        let mut by_age: Vec<(u64, String)> = inner
            .map
            .iter()
            .map(|(k, e)| (e.last_used, k.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(tick, _)| *tick);
        for (_, key) in by_age.into_iter().take(victims) {
            inner.map.remove(&key);
        }
    }

    pub fn invalidate(&self, mount_id: &str, dir_path: &str) {
        let key = Self::key(mount_id, dir_path);
        let mut inner = self.lock();
        if inner.map.remove(&key).is_some() {
            inner.invalidations += 1;
        }
    }

    /// Remove the entry for `path` and every ancestor directory up to `/`.
    /// A listing at `/a/b/c` depends on its whole ancestor chain, so any
    /// mutation below must clear the chain.
    pub fn invalidate_path_and_ancestors(&self, mount_id: &str, dir_path: &str) {
        let chain = path::ancestor_chain(dir_path);
        let mut inner = self.lock();
        for ancestor in chain {
            let key = Self::key(mount_id, &ancestor);
            if inner.map.remove(&key).is_some() {
                inner.invalidations += 1;
            }
        }
    }

    pub fn invalidate_mount(&self, mount_id: &str) {
        let prefix = format!("{mount_id}:");
        let mut inner = self.lock();
        let before = inner.map.len();
        inner.map.retain(|k, _| !k.starts_with(&prefix));
        inner.invalidations += (before - inner.map.len()) as u64;
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        let removed = inner.map.len() as u64;
        inner.map.clear();
        inner.invalidations += removed;
    }

    pub fn stats(&self) -> DirectoryCacheStats {
        let inner = self.lock();
        DirectoryCacheStats {
            hits: inner.hits,
            misses: inner.misses,
            invalidations: inner.invalidations,
            size: inner.map.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(name: &str) -> serde_json::Value {
        serde_json::json!({ "items": [name] })
    }

    #[test]
    fn get_after_set_hits_regardless_of_trailing_slash() {
        let cache = DirectoryCache::default();
        cache.set("m1", "/a/b", listing("x"), None);
        assert_eq!(cache.get("m1", "/a/b/"), Some(listing("x")));
        assert_eq!(cache.get("m1", "/a/b"), Some(listing("x")));
        assert_eq!(cache.get("m2", "/a/b"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = DirectoryCache::default();
        cache.set("m1", "/a", listing("x"), Some(Duration::ZERO));
        assert_eq!(cache.get("m1", "/a"), None);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn ancestor_invalidation_spares_descendants_and_other_mounts() {
        let cache = DirectoryCache::default();
        for p in ["/", "/a", "/a/b", "/a/b/c", "/a/b/c/d", "/x"] {
            cache.set("m1", p, listing(p), None);
        }
        cache.set("m2", "/a", listing("other"), None);

        cache.invalidate_path_and_ancestors("m1", "/a/b/c");

        for p in ["/", "/a", "/a/b", "/a/b/c"] {
            assert_eq!(cache.get("m1", p), None, "expected {p} invalidated");
        }
        // Strict descendants and unrelated paths stay.
        assert!(cache.get("m1", "/a/b/c/d").is_some());
        assert!(cache.get("m1", "/x").is_some());
        assert!(cache.get("m2", "/a").is_some());
    }

    #[test]
    fn mount_invalidation_scans_by_prefix() {
        let cache = DirectoryCache::default();
        cache.set("m1", "/a", listing("a"), None);
        cache.set("m10", "/a", listing("a"), None);
        cache.invalidate_mount("m1");
        assert_eq!(cache.get("m1", "/a"), None);
        // "m10:" does not share the "m1:" key prefix.
        assert!(cache.get("m10", "/a").is_some());
    }

    #[test]
    fn overflow_prunes_oldest_entries() {
        let cache = DirectoryCache::new(DirectoryCacheConfig {
            max_entries: 10,
            prune_percentage: 20,
            ..DirectoryCacheConfig::default()
        });
        for i in 0..10 {
            cache.set("m1", &format!("/d{i}"), listing("x"), None);
        }
        // Touch the first entries so the untouched middle becomes oldest.
        cache.get("m1", "/d0");
        cache.get("m1", "/d1");
        cache.set("m1", "/d10", listing("x"), None);

        let stats = cache.stats();
        assert!(stats.size <= 10);
        assert!(cache.get("m1", "/d0").is_some());
        assert!(cache.get("m1", "/d10").is_some());
    }
}
