//! Thread-safe caching primitives for the GitHub authenticator.
//!
//! Kept deliberately small: the caches here hold tens of entries (default
//! capacity 32), so recency bookkeeping is a monotonic counter and eviction
//! is a linear victim scan.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;

/// Plain LRU map. A `max_size` of zero disables storage entirely.
pub struct LruCache<K, V> {
    map: HashMap<K, (V, u64)>,
    max_size: usize,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            tick: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(key).map(|entry| {
            entry.1 = tick;
            &entry.0
        })
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.max_size == 0 {
            return;
        }
        if !self.map.contains_key(&key) && self.map.len() >= self.max_size {
            self.evict_one();
        }
        self.tick += 1;
        self.map.insert(key, (value, self.tick));
    }

    fn evict_one(&mut self) {
        let victim = self
            .map
            .iter()
            .min_by_key(|(_, (_, tick))| *tick)
            .map(|(k, _)| k.clone());
        if let Some(victim) = victim {
            self.map.remove(&victim);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

struct TlruEntry<V> {
    value: V,
    expires_at: Instant,
    tick: u64,
}

/// Time-aware LRU: every entry carries its own TTL, and recency eviction
/// kicks in when the cache is at capacity. An unbounded variant backs the
/// read-proxy cache, where only expiry evicts.
pub struct TlruCache<K, V> {
    map: HashMap<K, TlruEntry<V>>,
    max_size: Option<usize>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> TlruCache<K, V> {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            map: HashMap::new(),
            max_size: Some(max_size),
            tick: 0,
        }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            map: HashMap::new(),
            max_size: None,
            tick: 0,
        }
    }

    pub fn insert(&mut self, key: K, value: V, ttl: Duration) {
        self.purge_expired();
        if let Some(max) = self.max_size {
            if max == 0 {
                return;
            }
            if !self.map.contains_key(&key) && self.map.len() >= max {
                self.evict_one();
            }
        }
        self.tick += 1;
        self.map.insert(
            key,
            TlruEntry {
                value,
                expires_at: Instant::now() + ttl,
                tick: self.tick,
            },
        );
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if let Some(entry) = self.map.get(key) {
            if entry.expires_at <= Instant::now() {
                self.map.remove(key);
                return None;
            }
        }
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(key).map(|entry| {
            entry.tick = tick;
            &entry.value
        })
    }

    /// Remove and return a live entry.
    pub fn pop(&mut self, key: &K) -> Option<V> {
        let entry = self.map.remove(key)?;
        (entry.expires_at > Instant::now()).then_some(entry.value)
    }

    /// Number of live entries.
    pub fn len(&mut self) -> usize {
        self.purge_expired();
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Free slots before recency eviction would start.
    pub fn capacity_remaining(&mut self) -> usize {
        self.purge_expired();
        match self.max_size {
            Some(max) => max.saturating_sub(self.map.len()),
            None => usize::MAX,
        }
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.map.retain(|_, entry| entry.expires_at > now);
    }

    fn evict_one(&mut self) {
        let victim = self
            .map
            .iter()
            .min_by_key(|(_, entry)| entry.tick)
            .map(|(k, _)| k.clone());
        if let Some(victim) = victim {
            self.map.remove(&victim);
        }
    }
}

type SharedCall<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// Coalesces concurrent calls with the same key into one execution.
///
/// The first caller for a key runs the underlying future; everyone arriving
/// while it is in flight awaits the same shared future and observes the same
/// result, errors included. The entry is dropped once the call completes, so
/// a failed call can be retried by the next request.
pub struct SingleFlight<K, V, E> {
    inflight: Mutex<HashMap<K, SharedCall<V, E>>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F>(&self, key: K, make: F) -> Result<V, E>
    where
        F: FnOnce() -> BoxFuture<'static, Result<V, E>>,
    {
        let call = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let call = make().shared();
                    inflight.insert(key.clone(), call.clone());
                    call
                }
            }
        };

        let result = call.clone().await;

        let mut inflight = self.inflight.lock().unwrap();
        // Only the cohort that ran this call may clean up its entry; a
        // follow-up call may already have installed a fresh one.
        if let Some(current) = inflight.get(&key) {
            if Shared::ptr_eq(current, &call) {
                inflight.remove(&key);
            }
        }
        result
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
