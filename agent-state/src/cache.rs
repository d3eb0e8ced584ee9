//! TTL read cache over committed agent snapshots.
//!
//! Entries hold the `Arc` handed out by the store, so a hit costs one map
//! lookup. Tracker writes invalidate the agent's entry; otherwise a hit may
//! be stale by at most the configured TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::CacheConfig;
use crate::state::{AgentId, StoreSnapshot};

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups served from cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CachedSnapshot {
    snapshot: Arc<StoreSnapshot>,
    inserted_at: Instant,
}

/// Per-tracker snapshot cache.
pub struct StateCache {
    config: CacheConfig,
    entries: Mutex<HashMap<AgentId, CachedSnapshot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StateCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh entry for `agent_id`, counting the hit or miss.
    pub fn get(&self, agent_id: &str) -> Option<Arc<StoreSnapshot>> {
        let ttl = self.config.ttl();
        let mut entries = self.entries.lock();
        match entries.get(agent_id) {
            Some(cached) if cached.inserted_at.elapsed() < ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(agent_id, version = cached.snapshot.version, "Cache hit");
                Some(Arc::clone(&cached.snapshot))
            }
            Some(_) => {
                entries.remove(agent_id);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `snapshot` unless a newer version is already cached.
    pub fn insert(&self, agent_id: &str, snapshot: Arc<StoreSnapshot>) {
        let mut entries = self.entries.lock();
        if entries
            .get(agent_id)
            .is_some_and(|cached| cached.snapshot.version > snapshot.version)
        {
            return;
        }

        if !entries.contains_key(agent_id) && entries.len() >= self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, cached)| cached.inserted_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            agent_id.to_string(),
            CachedSnapshot {
                snapshot,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, agent_id: &str) {
        self.entries.lock().remove(agent_id);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateData, StateTag};
    use std::time::Duration;

    fn snapshot(version: u64) -> Arc<StoreSnapshot> {
        Arc::new(StoreSnapshot {
            current_state: StateTag::Initializing,
            data: StateData::new(),
            version,
        })
    }

    #[test]
    fn test_hits_misses_and_invalidation() {
        let cache = StateCache::new(CacheConfig::default());
        assert!(cache.get("a1").is_none());

        cache.insert("a1", snapshot(1));
        assert_eq!(cache.get("a1").unwrap().version, 1);

        cache.invalidate("a1");
        assert!(cache.get("a1").is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 2, 0));
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = StateCache::new(CacheConfig::default().with_ttl(Duration::from_millis(10)));
        cache.insert("a1", snapshot(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("a1").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_older_version_does_not_replace_newer() {
        let cache = StateCache::new(CacheConfig::default());
        cache.insert("a1", snapshot(5));
        cache.insert("a1", snapshot(3));
        assert_eq!(cache.get("a1").unwrap().version, 5);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = StateCache::new(CacheConfig::default().with_max_entries(2));
        cache.insert("a1", snapshot(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("a2", snapshot(1));
        cache.insert("a3", snapshot(1));

        assert_eq!(cache.stats().entries, 2);
        assert!(cache.get("a1").is_none());
        assert!(cache.get("a3").is_some());
    }
}
