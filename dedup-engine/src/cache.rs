//! Bounded TTL cache of store existence answers.
//!
//! Keys are validated ids, values are whether the id exists in the store. Entries expire a
//! fixed time after insertion and are evicted oldest-inserted first when the cache fills up,
//! so staleness is bounded by the TTL whatever the access pattern.
//!
//! Only "exists" answers are cached unless negative caching is turned on: a new record is
//! cheap to re-check, and re-checking picks up rows inserted by other writers in between.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::EngineConfig;
use crate::metrics_consts::{
    CACHE_EVICTIONS_COUNTER, CACHE_HITS_COUNTER, CACHE_MISSES_COUNTER, CACHE_SIZE_GAUGE,
};
use crate::time::{SystemTime, TimeSource};

/// Cleanup evicts down to this share of the maximum size.
const EVICTION_TARGET_PERCENT: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub exists: bool,
    pub inserted_at: Instant,
}

/// Outcome of looking up a batch of ids at once.
#[derive(Debug, Default)]
pub struct CacheLookup {
    pub hits: HashMap<String, bool>,
    /// Ids that must be asked to the store, in the order they were given.
    pub misses: Vec<String>,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    max_size: usize,
}

pub struct QueryCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    base_max_size: usize,
    adaptive_max_size: usize,
    cache_negative_results: bool,
    clock: Arc<dyn TimeSource + Send + Sync>,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                max_size,
            }),
            ttl,
            base_max_size: max_size,
            adaptive_max_size: max_size,
            cache_negative_results: false,
            clock: Arc::new(SystemTime {}),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.cache_ttl.0, config.max_cache_size)
            .with_adaptive_max_size(config.adaptive_max_cache_size)
            .with_negative_results(config.cache_negative_results)
    }

    /// Allow `adapt_capacity` to grow the cache up to `adaptive_max_size` entries.
    pub fn with_adaptive_max_size(mut self, adaptive_max_size: usize) -> Self {
        self.adaptive_max_size = adaptive_max_size.max(self.base_max_size);
        self
    }

    pub fn with_negative_results(mut self, enabled: bool) -> Self {
        self.cache_negative_results = enabled;
        self
    }

    pub fn with_time_source(mut self, clock: Arc<dyn TimeSource + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Return the cached answer for `id`, or `None` if it is absent or expired.
    pub fn lookup(&self, id: &str) -> Option<bool> {
        let now = self.clock.now();
        let mut state = self.lock();

        let answer = match state.entries.get(id) {
            Some(entry) if self.is_fresh(entry, now) => Some(entry.exists),
            Some(_) => {
                state.entries.remove(id);
                None
            }
            None => None,
        };

        match answer {
            Some(_) => metrics::counter!(CACHE_HITS_COUNTER).increment(1),
            None => metrics::counter!(CACHE_MISSES_COUNTER).increment(1),
        }
        answer
    }

    /// Look up every id under a single lock.
    pub fn lookup_many(&self, ids: &[String]) -> CacheLookup {
        let now = self.clock.now();
        let mut state = self.lock();
        let mut lookup = CacheLookup::default();

        for id in ids {
            match state.entries.get(id) {
                Some(entry) if self.is_fresh(entry, now) => {
                    lookup.hits.insert(id.clone(), entry.exists);
                }
                Some(_) => {
                    state.entries.remove(id);
                    lookup.misses.push(id.clone());
                }
                None => lookup.misses.push(id.clone()),
            }
        }

        metrics::counter!(CACHE_HITS_COUNTER).increment(lookup.hits.len() as u64);
        metrics::counter!(CACHE_MISSES_COUNTER).increment(lookup.misses.len() as u64);
        lookup
    }

    /// Remember the store's answer for `id`. Re-inserting an id refreshes its insertion time.
    pub fn put(&self, id: &str, exists: bool) {
        if !exists && !self.cache_negative_results {
            return;
        }

        let now = self.clock.now();
        let mut state = self.lock();
        self.insert_locked(&mut state, id, exists, now);
        metrics::gauge!(CACHE_SIZE_GAUGE).set(state.entries.len() as f64);
    }

    pub fn put_many<'a, I>(&self, answers: I)
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let now = self.clock.now();
        let mut state = self.lock();
        for (id, exists) in answers {
            if exists || self.cache_negative_results {
                self.insert_locked(&mut state, id, exists, now);
            }
        }
        metrics::gauge!(CACHE_SIZE_GAUGE).set(state.entries.len() as f64);
    }

    /// Drop expired entries, then the oldest entries if still above 80% of capacity.
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let removed = self.cleanup_locked(&mut state, now);
        metrics::gauge!(CACHE_SIZE_GAUGE).set(state.entries.len() as f64);
        removed
    }

    /// Grow capacity for a call that will look up `expected_ids` ids, up to the adaptive
    /// maximum. Capacity never shrinks below what it already is.
    pub fn adapt_capacity(&self, expected_ids: usize) {
        let target = expected_ids.clamp(self.base_max_size, self.adaptive_max_size);
        let mut state = self.lock();
        if target > state.max_size {
            debug!(
                from = state.max_size,
                to = target,
                "growing duplicate query cache"
            );
            state.max_size = target;
        }
    }

    pub fn max_size(&self) -> usize {
        self.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.max_size = self.base_max_size;
        metrics::gauge!(CACHE_SIZE_GAUGE).set(0.0);
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) < self.ttl
    }

    fn insert_locked(&self, state: &mut CacheState, id: &str, exists: bool, now: Instant) {
        if !state.entries.contains_key(id) && state.entries.len() >= state.max_size {
            self.cleanup_locked(state, now);
        }
        state.entries.insert(
            id.to_owned(),
            CacheEntry {
                exists,
                inserted_at: now,
            },
        );
    }

    fn cleanup_locked(&self, state: &mut CacheState, now: Instant) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, entry| self.is_fresh(entry, now));
        let expired = before - state.entries.len();

        let target = state.max_size * EVICTION_TARGET_PERCENT / 100;
        let mut evicted = 0;
        if state.entries.len() > target {
            let mut by_age: Vec<(Instant, String)> = state
                .entries
                .iter()
                .map(|(id, entry)| (entry.inserted_at, id.clone()))
                .collect();
            by_age.sort_unstable_by_key(|(inserted_at, _)| *inserted_at);

            // Strictly below the target, but never more than what is there.
            evicted = (state.entries.len() - target + 1).min(state.entries.len());
            for (_, id) in by_age.into_iter().take(evicted) {
                state.entries.remove(&id);
            }
        }

        metrics::counter!(CACHE_EVICTIONS_COUNTER, "reason" => "expired").increment(expired as u64);
        metrics::counter!(CACHE_EVICTIONS_COUNTER, "reason" => "capacity")
            .increment(evicted as u64);
        debug!(expired, evicted, "duplicate query cache cleanup");

        expired + evicted
    }
}
