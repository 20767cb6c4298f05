//! Violation history.

use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::{RateLimitViolation, ScopeKey, ViolationAction};
use crate::resilience::{retry_blocking, RetryPolicy};
use crate::storage::{JsonlError, JsonlFile};

/// A stored violation with its tracker-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub id: u64,
    pub violation: RateLimitViolation,
}

#[derive(Debug, Error)]
pub enum ViolationError {
    #[error("violation persistence failed after {attempts} attempts: {message}")]
    PersistenceExhausted { attempts: u32, message: String },

    #[error("violation store error: {0}")]
    Store(#[from] JsonlError),
}

/// Filter for violation listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViolationFilter {
    pub rule_id: Option<String>,
    pub scope_key: Option<ScopeKey>,
    pub action: Option<ViolationAction>,
    /// Inclusive.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ViolationFilter {
    pub fn rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn scope(mut self, scope: ScopeKey) -> Self {
        self.scope_key = Some(scope);
        self
    }

    pub fn action(mut self, action: ViolationAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn since(mut self, t: DateTime<Utc>) -> Self {
        self.since = Some(t);
        self
    }

    pub fn until(mut self, t: DateTime<Utc>) -> Self {
        self.until = Some(t);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn accepts(&self, v: &RateLimitViolation) -> bool {
        self.rule_id.as_deref().map_or(true, |r| v.rule_id == r)
            && self.scope_key.as_ref().map_or(true, |s| &v.scope_key == s)
            && self.action.map_or(true, |a| v.action == a)
    }
}

/// Append-only violation log, kept ordered by violation timestamp.
#[derive(Debug)]
pub struct ViolationTracker {
    /// Serializes id assignment and the durable append.
    next_id: Mutex<u64>,
    entries: RwLock<Vec<ViolationRecord>>,
    file: Option<JsonlFile>,
    retry: RetryPolicy,
}

impl ViolationTracker {
    pub fn in_memory() -> Self {
        Self {
            next_id: Mutex::new(1),
            entries: RwLock::new(Vec::new()),
            file: None,
            retry: RetryPolicy::no_retry(),
        }
    }

    /// Open a JSON-lines backed tracker, reloading existing records.
    pub fn open(path: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self, ViolationError> {
        let file = JsonlFile::open(path)?;
        let mut records: Vec<ViolationRecord> = file.load()?;
        records.sort_by_key(|r| (r.violation.timestamp, r.id));
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;

        Ok(Self {
            next_id: Mutex::new(next_id),
            entries: RwLock::new(records),
            file: Some(file),
            retry,
        })
    }

    /// Persist a violation and return its id.
    pub fn record(&self, violation: RateLimitViolation) -> Result<u64, ViolationError> {
        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let record = ViolationRecord {
            id: *next_id,
            violation,
        };

        if let Some(file) = &self.file {
            retry_blocking(&self.retry, "violation_append", || file.append(&record)).map_err(|exhausted| {
                ViolationError::PersistenceExhausted {
                    attempts: exhausted.attempts,
                    message: exhausted.last_error.to_string(),
                }
            })?;
        }
        *next_id += 1;

        tracing::debug!(
            id = record.id,
            rule = %record.violation.rule_id,
            scope = %record.violation.scope_key,
            action = record.violation.action.as_str(),
            "Violation recorded"
        );

        let id = record.id;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Writes arrive through a queue and may be slightly out of order.
        let pos = entries.partition_point(|r| r.violation.timestamp <= record.violation.timestamp);
        entries.insert(pos, record);
        Ok(id)
    }

    /// Matching violations, newest first.
    pub fn list_violations(&self, filter: &ViolationFilter) -> Vec<ViolationRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let range = time_range(&entries, filter.since, filter.until);
        let matching = entries[range]
            .iter()
            .rev()
            .filter(|r| filter.accepts(&r.violation))
            .cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Number of matching violations. `limit` is ignored.
    pub fn count(&self, filter: &ViolationFilter) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let range = time_range(&entries, filter.since, filter.until);
        entries[range].iter().filter(|r| filter.accepts(&r.violation)).count()
    }

    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.count(&ViolationFilter::default().since(since))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn time_range(
    entries: &[ViolationRecord],
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> std::ops::Range<usize> {
    let start = since.map_or(0, |t| entries.partition_point(|r| r.violation.timestamp < t));
    let end = until.map_or(entries.len(), |t| entries.partition_point(|r| r.violation.timestamp < t));
    start..end.max(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Granularity, WindowCount};
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
    }

    fn violation(rule: &str, ip: &str, offset_secs: i64, action: ViolationAction) -> RateLimitViolation {
        RateLimitViolation {
            rule_id: rule.into(),
            scope_key: ScopeKey::Ip { ip: ip.into() },
            endpoint: "/api/auth/login".into(),
            method: "POST".into(),
            timestamp: start() + Duration::seconds(offset_secs),
            counts: vec![WindowCount {
                granularity: Granularity::Minute,
                window_start: Granularity::Minute.window_start(start()),
                count: 11,
                limit: 10,
            }],
            action,
        }
    }

    #[test]
    fn test_record_and_filter() {
        let tracker = ViolationTracker::in_memory();
        tracker.record(violation("auth", "1.1.1.1", 0, ViolationAction::Denied)).unwrap();
        tracker.record(violation("auth", "2.2.2.2", 10, ViolationAction::Denied)).unwrap();
        tracker.record(violation("api", "1.1.1.1", 20, ViolationAction::DeniedAndBlocked)).unwrap();

        let auth = tracker.list_violations(&ViolationFilter::default().rule("auth"));
        assert_eq!(auth.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);

        let ip = tracker.list_violations(&ViolationFilter::default().scope(ScopeKey::Ip { ip: "1.1.1.1".into() }));
        assert_eq!(ip.len(), 2);

        let blocked = ViolationFilter::default().action(ViolationAction::DeniedAndBlocked);
        assert_eq!(tracker.count(&blocked), 1);

        assert_eq!(tracker.count_since(start() + Duration::seconds(10)), 2);
        assert_eq!(tracker.list_violations(&ViolationFilter::default().limit(1))[0].id, 3);
    }

    #[test]
    fn test_out_of_order_arrivals_are_sorted() {
        let tracker = ViolationTracker::in_memory();
        tracker.record(violation("a", "x", 30, ViolationAction::Denied)).unwrap();
        tracker.record(violation("a", "x", 10, ViolationAction::Denied)).unwrap();

        let listed = tracker.list_violations(&ViolationFilter::default());
        assert_eq!(listed[0].violation.timestamp, start() + Duration::seconds(30));
        assert_eq!(listed[1].violation.timestamp, start() + Duration::seconds(10));
    }

    #[test]
    fn test_persisted_tracker_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("violations.jsonl");

        {
            let tracker = ViolationTracker::open(&path, RetryPolicy::no_retry()).unwrap();
            tracker.record(violation("auth", "1.1.1.1", 0, ViolationAction::Denied)).unwrap();
            tracker.record(violation("auth", "1.1.1.1", 5, ViolationAction::Denied)).unwrap();
        }

        let reopened = ViolationTracker::open(&path, RetryPolicy::no_retry()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.record(violation("auth", "1.1.1.1", 9, ViolationAction::Denied)).unwrap(), 3);
    }

    #[test]
    fn test_retried_append_is_not_duplicated_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("violations.jsonl");
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };

        {
            let tracker = ViolationTracker::open(&path, retry).unwrap();
            tracker.file.as_ref().unwrap().fail_next_syncs(1);
            assert_eq!(tracker.record(violation("auth", "1.1.1.1", 0, ViolationAction::Denied)).unwrap(), 1);
            assert_eq!(tracker.record(violation("auth", "1.1.1.1", 5, ViolationAction::Denied)).unwrap(), 2);
        }

        let reopened = ViolationTracker::open(&path, RetryPolicy::no_retry()).unwrap();
        assert_eq!(reopened.len(), 2);
        let mut ids: Vec<u64> = reopened
            .list_violations(&ViolationFilter::default())
            .iter()
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(reopened.count_since(start()), 2);
    }
}
