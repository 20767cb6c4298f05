//! The event recorder: sequencing, chaining and durable append.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::chain::{compute_hash, verify_chain, GENESIS_HASH};
use crate::audit::store::EventStore;
use crate::audit::types::{AuditError, AuditResult, EventQuery, NewSecurityEvent, SecurityEvent};
use crate::clock::SharedClock;
use crate::observability::metrics;
use crate::resilience::{retry_blocking, RetryPolicy};

/// Tail of the chain; guarded by the append lock.
#[derive(Debug)]
struct ChainTip {
    next_sequence: u64,
    last_hash: String,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only, hash-chained security event log.
///
/// Appends are serialized on one lock around sequence assignment and the
/// durable write. The read index is updated only after the store confirms
/// the write, so readers never observe an event that was not persisted.
#[derive(Debug)]
pub struct EventRecorder {
    store: Arc<dyn EventStore>,
    tip: Mutex<ChainTip>,
    index: RwLock<Vec<SecurityEvent>>,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl EventRecorder {
    /// Open a recorder over a store, reloading and verifying persisted events.
    pub fn open(store: Arc<dyn EventStore>, clock: SharedClock, retry: RetryPolicy) -> AuditResult<Self> {
        let events = store.load()?;
        verify_chain(&events)?;

        let tip = ChainTip {
            next_sequence: events.last().map_or(1, |e| e.sequence + 1),
            last_hash: events
                .last()
                .map_or_else(|| GENESIS_HASH.to_string(), |e| e.hash.clone()),
            last_timestamp: events.last().map(|e| e.timestamp),
        };

        if !events.is_empty() {
            tracing::info!(events = events.len(), next_sequence = tip.next_sequence, "Audit log reloaded and verified");
        }

        Ok(Self {
            store,
            tip: Mutex::new(tip),
            index: RwLock::new(events),
            clock,
            retry,
        })
    }

    /// Append an event. Returns its sequence number once it is durable.
    pub fn log(&self, new: NewSecurityEvent) -> AuditResult<u64> {
        let mut tip = self.tip.lock().unwrap_or_else(PoisonError::into_inner);

        // Keep timestamps monotonic so sequence order and time order agree.
        let now = self.clock.now();
        let timestamp = tip.last_timestamp.map_or(now, |last| now.max(last));

        let mut event = SecurityEvent {
            id: Uuid::new_v4(),
            sequence: tip.next_sequence,
            event_type: new.event_type,
            user_id: new.user_id,
            ip: new.ip,
            user_agent: new.user_agent,
            timestamp,
            severity: new.severity,
            details: new.details,
            prev_hash: tip.last_hash.clone(),
            hash: String::new(),
        };
        event.hash = compute_hash(&event)?;

        if let Err(exhausted) = retry_blocking(&self.retry, "audit_append", || self.store.append(&event)) {
            metrics::record_audit_failure("persistence_exhausted");
            tracing::error!(
                critical = true,
                event_type = %event.event_type,
                severity = %event.severity,
                attempts = exhausted.attempts,
                error = %exhausted.last_error,
                "Security event could not be persisted"
            );
            return Err(AuditError::PersistenceExhausted {
                attempts: exhausted.attempts,
                message: exhausted.last_error.to_string(),
            });
        }

        let sequence = event.sequence;
        tip.next_sequence += 1;
        tip.last_hash = event.hash.clone();
        tip.last_timestamp = Some(event.timestamp);

        metrics::record_audit_append(event.severity);
        tracing::debug!(sequence, event_type = %event.event_type, severity = %event.severity, "Security event recorded");

        // Still under the append lock: index order equals sequence order.
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);

        Ok(sequence)
    }

    /// Matching events, newest first.
    pub fn query_events(&self, query: &EventQuery) -> Vec<SecurityEvent> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let range = time_range(&index, query);
        let matching = index[range].iter().rev().filter(|e| query.accepts(e)).cloned();
        match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Number of matching events. `limit` is ignored.
    pub fn count_events(&self, query: &EventQuery) -> usize {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let range = time_range(&index, query);
        index[range].iter().filter(|e| query.accepts(e)).count()
    }

    /// Event by sequence number.
    pub fn get(&self, sequence: u64) -> Option<SecurityEvent> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let pos = sequence.checked_sub(1)? as usize;
        index.get(pos).filter(|e| e.sequence == sequence).cloned()
    }

    /// Re-verify the in-memory chain.
    pub fn verify(&self) -> AuditResult<()> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        verify_chain(index.iter())
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash of the newest event, or the genesis hash for an empty log.
    pub fn head_hash(&self) -> String {
        self.tip.lock().unwrap_or_else(PoisonError::into_inner).last_hash.clone()
    }
}

/// Index slice for the query's time bounds; relies on monotonic timestamps.
fn time_range(index: &[SecurityEvent], query: &EventQuery) -> std::ops::Range<usize> {
    let start = query
        .since
        .map_or(0, |since| index.partition_point(|e| e.timestamp < since));
    let end = query
        .until
        .map_or(index.len(), |until| index.partition_point(|e| e.timestamp < until));
    start..end.max(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::store::{InMemoryEventStore, JsonlEventStore};
    use crate::audit::types::Severity;
    use crate::clock::MockClock;
    use crate::storage::JsonlError;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn recorder(clock: &MockClock) -> EventRecorder {
        EventRecorder::open(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(clock.clone()),
            RetryPolicy::no_retry(),
        )
        .unwrap()
    }

    /// Fails the first `failures` appends.
    #[derive(Debug)]
    struct FlakyStore {
        failures: AtomicU32,
        inner: InMemoryEventStore,
    }

    impl EventStore for FlakyStore {
        fn append(&self, event: &SecurityEvent) -> Result<(), JsonlError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(JsonlError::Io {
                    path: "flaky".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk unavailable"),
                });
            }
            self.inner.append(event)
        }

        fn load(&self) -> Result<Vec<SecurityEvent>, JsonlError> {
            self.inner.load()
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_sequences_and_chain() {
        let clock = MockClock::new(start());
        let rec = recorder(&clock);

        assert_eq!(rec.head_hash(), GENESIS_HASH);
        assert_eq!(rec.log(NewSecurityEvent::new("a", Severity::Low)).unwrap(), 1);
        assert_eq!(rec.log(NewSecurityEvent::new("b", Severity::High)).unwrap(), 2);

        let second = rec.get(2).unwrap();
        assert_eq!(second.prev_hash, rec.get(1).unwrap().hash);
        assert_eq!(rec.head_hash(), second.hash);
        assert!(rec.verify().is_ok());
    }

    #[test]
    fn test_query_filters_newest_first() {
        let clock = MockClock::new(start());
        let rec = recorder(&clock);

        rec.log(NewSecurityEvent::new("login_failed", Severity::Medium).user("alice")).unwrap();
        clock.advance(Duration::minutes(1));
        rec.log(NewSecurityEvent::new("login_failed", Severity::Medium).user("bob")).unwrap();
        clock.advance(Duration::minutes(1));
        rec.log(NewSecurityEvent::new("key_rotated", Severity::High)).unwrap();
        clock.advance(Duration::minutes(1));
        rec.log(NewSecurityEvent::new("login_failed", Severity::Critical).user("alice")).unwrap();

        let alice = rec.query_events(&EventQuery::default().user("alice"));
        assert_eq!(alice.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 1]);

        let failed = rec.query_events(&EventQuery::default().event_type("login_failed").limit(2));
        assert_eq!(failed.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 2]);

        let window = EventQuery::default()
            .since(start() + Duration::minutes(1))
            .until(start() + Duration::minutes(3));
        assert_eq!(rec.count_events(&window), 2);

        assert_eq!(rec.count_events(&EventQuery::default().severity(Severity::High)), 1);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let clock = MockClock::new(start());
        let rec = recorder(&clock);

        rec.log(NewSecurityEvent::new("a", Severity::Low)).unwrap();
        clock.set(start() - Duration::seconds(30));
        rec.log(NewSecurityEvent::new("b", Severity::Low)).unwrap();

        assert_eq!(rec.get(2).unwrap().timestamp, start());
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let clock = MockClock::new(start());
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(2),
            inner: InMemoryEventStore::new(),
        });
        let rec = EventRecorder::open(store.clone(), Arc::new(clock), fast_retry(3)).unwrap();

        assert_eq!(rec.log(NewSecurityEvent::new("a", Severity::Low)).unwrap(), 1);
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_exhausted_failure_is_reported_and_not_visible() {
        let clock = MockClock::new(start());
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(10),
            inner: InMemoryEventStore::new(),
        });
        let rec = EventRecorder::open(store.clone(), Arc::new(clock), fast_retry(3)).unwrap();

        let err = rec.log(NewSecurityEvent::new("a", Severity::Critical)).unwrap_err();
        assert!(matches!(err, AuditError::PersistenceExhausted { attempts: 3, .. }));
        assert!(rec.is_empty());

        // The sequence is not consumed by a failed append.
        store.failures.store(0, Ordering::SeqCst);
        assert_eq!(rec.log(NewSecurityEvent::new("b", Severity::Low)).unwrap(), 1);
    }

    #[test]
    fn test_append_retried_after_sync_failure_reopens_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let clock = MockClock::new(start());

        {
            let store = Arc::new(JsonlEventStore::open(&path).unwrap());
            // The line reaches the file but the sync reports an error.
            store.file().fail_next_syncs(1);
            let rec = EventRecorder::open(store, Arc::new(clock.clone()), fast_retry(3)).unwrap();
            assert_eq!(rec.log(NewSecurityEvent::new("a", Severity::Low)).unwrap(), 1);
            assert_eq!(rec.log(NewSecurityEvent::new("b", Severity::Low)).unwrap(), 2);
        }

        let reopened = EventRecorder::open(
            Arc::new(JsonlEventStore::open(&path).unwrap()),
            Arc::new(clock),
            RetryPolicy::no_retry(),
        )
        .unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(1).unwrap().event_type, "a");
        assert_eq!(reopened.get(2).unwrap().event_type, "b");
    }

    #[test]
    fn test_exhausted_sync_failures_do_not_reuse_a_persisted_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let clock = MockClock::new(start());

        {
            let store = Arc::new(JsonlEventStore::open(&path).unwrap());
            store.file().fail_next_syncs(3);
            let rec = EventRecorder::open(store, Arc::new(clock.clone()), fast_retry(3)).unwrap();
            let err = rec.log(NewSecurityEvent::new("lost", Severity::High)).unwrap_err();
            assert!(matches!(err, AuditError::PersistenceExhausted { attempts: 3, .. }));
            assert_eq!(rec.log(NewSecurityEvent::new("kept", Severity::Low)).unwrap(), 1);
        }

        let reopened = EventRecorder::open(
            Arc::new(JsonlEventStore::open(&path).unwrap()),
            Arc::new(clock),
            RetryPolicy::no_retry(),
        )
        .unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(1).unwrap().event_type, "kept");
    }

    #[test]
    fn test_concurrent_appends_get_unique_sequences() {
        let clock = MockClock::new(start());
        let rec = Arc::new(recorder(&clock));

        let mut sequences: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let rec = rec.clone();
                    s.spawn(move || {
                        (0..25)
                            .map(|i| {
                                rec.log(NewSecurityEvent::new("load", Severity::Low).detail("t", t).detail("i", i))
                                    .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        sequences.sort_unstable();
        assert_eq!(sequences, (1..=100).collect::<Vec<_>>());
        assert!(rec.verify().is_ok());
    }
}
