//! Bounded LRU + TTL cache over merged policy sets.
//!
//! Keys are the `(org, app, user?)` tuple the evaluator resolves for.
//! Recency is a monotonic tick per entry; eviction scans for the minimum,
//! which stays cheap at the configured sizes. A background sweeper calls
//! `cleanup_expired` on a cadence but correctness only relies on the in-line
//! expiry check in `get`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::models::policy::Policy;

pub type PolicyCacheKey = (Uuid, Uuid, Option<Uuid>);

struct Entry {
    policies: Arc<Vec<Policy>>,
    inserted_at: Instant,
    last_used: u64,
}

struct Inner {
    entries: HashMap<PolicyCacheKey, Entry>,
    tick: u64,
}

pub struct PolicyCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl PolicyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
            max_entries: max_entries.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached merged policy list, removing the entry in-line if
    /// its TTL has elapsed.
    pub fn get(&self, key: &PolicyCacheKey) -> Option<Arc<Vec<Policy>>> {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            inner.entries.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(key).expect("checked above");
        entry.last_used = tick;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&entry.policies))
    }

    /// Insert or replace. Replacement promotes the entry; insertion into a
    /// full cache evicts the least-recently-used entry first.
    pub fn set(&self, key: PolicyCacheKey, policies: Vec<Policy>) {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.policies = Arc::new(policies);
            entry.inserted_at = Instant::now();
            entry.last_used = tick;
            return;
        }

        if inner.entries.len() >= self.max_entries {
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k)
            {
                inner.entries.remove(&lru_key);
            }
        }

        inner.entries.insert(
            key,
            Entry {
                policies: Arc::new(policies),
                inserted_at: Instant::now(),
                last_used: tick,
            },
        );
    }

    pub fn invalidate(&self, key: &PolicyCacheKey) {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        inner.entries.remove(key);
    }

    pub fn invalidate_org(&self, org_id: Uuid) {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        inner.entries.retain(|(org, _, _), _| *org != org_id);
    }

    pub fn invalidate_app(&self, org_id: Uuid, app_id: Uuid) {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        inner
            .entries
            .retain(|(org, app, _), _| !(*org == org_id && *app == app_id));
    }

    pub fn invalidate_user(&self, org_id: Uuid, app_id: Uuid, user_id: Uuid) {
        self.invalidate(&(org_id, app_id, Some(user_id)));
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        inner.entries.clear();
    }

    /// Drops expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("policy cache lock poisoned");
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let size = self
            .inner
            .lock()
            .expect("policy cache lock poisoned")
            .entries
            .len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            max_size: self.max_entries,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}
