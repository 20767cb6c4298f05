//! Block entries keyed by scope.
//!
//! Lookup is a single hash probe and runs before any counter work.
//! Expired entries are removed lazily on lookup and in bulk by `purge_expired`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::ratelimit::types::{BlockEntry, ScopeKey};

#[derive(Debug, Default)]
pub struct BlockStore {
    entries: DashMap<ScopeKey, BlockEntry>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unexpired block for `scope`, if any.
    pub fn active(&self, scope: &ScopeKey, now: DateTime<Utc>) -> Option<BlockEntry> {
        let entry = self.entries.get(scope)?;
        if entry.is_active(now) {
            return Some(entry.clone());
        }
        drop(entry);
        self.entries.remove_if(scope, |_, e| !e.is_active(now));
        None
    }

    /// Insert a block. An existing block that outlives the new one is kept.
    pub fn insert(&self, block: BlockEntry) {
        self.entries
            .entry(block.scope_key.clone())
            .and_modify(|existing| {
                if block.expires_at > existing.expires_at {
                    *existing = block.clone();
                }
            })
            .or_insert_with(|| block.clone());
    }

    pub fn remove(&self, scope: &ScopeKey) -> Option<BlockEntry> {
        self.entries.remove(scope).map(|(_, entry)| entry)
    }

    /// All unexpired blocks.
    pub fn list_active(&self, now: DateTime<Utc>) -> Vec<BlockEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_active(now))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_active(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
