//! Window counter storage.
//!
//! # Responsibilities
//! - Atomically increment-and-read one `(rule, scope, granularity, window)` counter
//! - Drop counters whose window has ended
//!
//! # Design Decisions
//! - Counters are sharded by key (`DashMap`); no lock spans more than one shard
//! - The increment is a single `fetch_add`, so concurrent callers always observe
//!   distinct post-increment values
//! - Counters are never decremented; a new window starts a new key

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::ratelimit::types::{Granularity, ScopeKey, StoreUnavailable};

/// Identity of a single window counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub rule_id: String,
    pub scope: ScopeKey,
    pub granularity: Granularity,
    /// Unix timestamp of the window start.
    pub window_start: i64,
}

impl CounterKey {
    pub fn new(rule_id: &str, scope: &ScopeKey, granularity: Granularity, now: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            scope: scope.clone(),
            granularity,
            window_start: granularity.window_start(now),
        }
    }

    fn window_end(&self) -> i64 {
        self.window_start + self.granularity.seconds()
    }
}

/// Backend for window counters.
///
/// Injected into the limiter so tests can substitute a fake.
pub trait CounterStore: Send + Sync + Debug {
    /// Increment the counter and return the post-increment value.
    fn increment(&self, key: &CounterKey) -> Result<u64, StoreUnavailable>;

    /// Current value, zero if the counter does not exist.
    fn get(&self, key: &CounterKey) -> Result<u64, StoreUnavailable>;

    /// Remove counters whose window ended at or before `now`. Returns how many were removed.
    fn prune(&self, now: DateTime<Utc>) -> usize;
}

/// Process-local counter store.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<CounterKey, AtomicU64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn increment(&self, key: &CounterKey) -> Result<u64, StoreUnavailable> {
        // Fast path: shared shard lock only.
        if let Some(counter) = self.counters.get(key) {
            return Ok(counter.fetch_add(1, Ordering::AcqRel) + 1);
        }
        let counter = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0));
        Ok(counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn get(&self, key: &CounterKey) -> Result<u64, StoreUnavailable> {
        Ok(self
            .counters
            .get(key)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0))
    }

    fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        let now = now.timestamp();
        self.counters.retain(|key, _| key.window_end() > now);
        before.saturating_sub(self.counters.len())
    }
}
